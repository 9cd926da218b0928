use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::env;

use crate::errors::{StorageError, StorageResult};

const DEFAULT_UPLOAD_URL_TTL_SECS: u64 = 900;
const MAX_UPLOAD_URL_TTL_SECS: u64 = 3600;
const DEFAULT_DOWNLOAD_CACHE_TTL_SECS: u64 = 3600;
const MIN_SIGNING_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// SQLite metadata plus sharded payload files under `storage_dir`.
    Disk,
    /// Process-local, non-durable storage.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub storage_dir: String,
    pub database_url: String,
    pub default_bucket: String,
    pub private_object_dir: String,
    pub public_object_search_paths: Vec<String>,
    pub public_base_url: String,
    pub signing_secret: String,
    pub upload_url_ttl_secs: u64,
    pub download_cache_ttl_secs: u64,
    pub group_file: Option<String>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("default_bucket", &self.default_bucket)
            .field("private_object_dir", &self.private_object_dir)
            .field("public_object_search_paths", &self.public_object_search_paths)
            .field("public_base_url", &self.public_base_url)
            .field("signing_secret", &"<redacted>")
            .field("upload_url_ttl_secs", &self.upload_url_ttl_secs)
            .field("download_cache_ttl_secs", &self.download_cache_ttl_secs)
            .field("group_file", &self.group_file)
            .finish()
    }
}

/// Read-only settings the storage service needs at request time.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub default_bucket: String,
    pub private_object_dir: String,
    pub public_object_search_paths: Vec<String>,
    pub upload_url_ttl_secs: u64,
    pub download_cache_ttl_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Access-controlled object storage gateway")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides OBJECT_GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Directory where object payloads are stored (overrides OBJECT_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket used for relative paths (overrides OBJECT_GATEWAY_DEFAULT_BUCKET)
    #[arg(long)]
    pub default_bucket: Option<String>,

    /// Root of private, ACL-managed objects (overrides PRIVATE_OBJECT_DIR)
    #[arg(long)]
    pub private_object_dir: Option<String>,

    /// Comma-separated public search roots (overrides PUBLIC_OBJECT_SEARCH_PATHS)
    #[arg(long)]
    pub public_object_search_paths: Option<String>,

    /// Externally visible base URL for capability links (overrides OBJECT_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// HMAC key for capability URLs (overrides OBJECT_GATEWAY_SIGNING_SECRET)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Lifetime of upload URLs in seconds (overrides OBJECT_GATEWAY_UPLOAD_URL_TTL_SECS)
    #[arg(long)]
    pub upload_url_ttl_secs: Option<u64>,

    /// max-age sent on downloads (overrides OBJECT_GATEWAY_DOWNLOAD_CACHE_TTL_SECS)
    #[arg(long)]
    pub download_cache_ttl_secs: Option<u64>,

    /// JSON file of static group memberships (overrides OBJECT_GATEWAY_GROUP_FILE)
    #[arg(long)]
    pub group_file: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_parts(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge parsed CLI args over values from `lookup`, then defaults.
    pub fn from_parts(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_u64 = |name: &str| -> Result<Option<u64>> {
            lookup(name)
                .map(|value| {
                    value
                        .parse::<u64>()
                        .with_context(|| format!("parsing {} value `{}`", name, value))
                })
                .transpose()
        };

        let env_port = match lookup("OBJECT_GATEWAY_PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing OBJECT_GATEWAY_PORT value `{}`", value))?,
            None => 3000,
        };
        let env_backend = match lookup("OBJECT_GATEWAY_BACKEND") {
            Some(value) => BackendKind::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!("parsing OBJECT_GATEWAY_BACKEND: {}", err))?,
            None => BackendKind::Disk,
        };

        let host = args
            .host
            .or_else(|| lookup("OBJECT_GATEWAY_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = args.port.unwrap_or(env_port);

        let search_paths = args
            .public_object_search_paths
            .or_else(|| lookup("PUBLIC_OBJECT_SEARCH_PATHS"))
            .unwrap_or_default();

        let public_base_url = args
            .public_base_url
            .or_else(|| lookup("OBJECT_GATEWAY_PUBLIC_BASE_URL"))
            .unwrap_or_else(|| format!("http://{}:{}", host, port));

        Ok(Self {
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("OBJECT_GATEWAY_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("OBJECT_GATEWAY_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/object_gateway.db".into()),
            default_bucket: args
                .default_bucket
                .or_else(|| lookup("OBJECT_GATEWAY_DEFAULT_BUCKET"))
                .unwrap_or_default(),
            private_object_dir: args
                .private_object_dir
                .or_else(|| lookup("PRIVATE_OBJECT_DIR"))
                .unwrap_or_default(),
            public_object_search_paths: split_search_paths(&search_paths),
            public_base_url,
            signing_secret: args
                .signing_secret
                .or_else(|| lookup("OBJECT_GATEWAY_SIGNING_SECRET"))
                .unwrap_or_default(),
            upload_url_ttl_secs: match args.upload_url_ttl_secs {
                Some(v) => v,
                None => env_u64("OBJECT_GATEWAY_UPLOAD_URL_TTL_SECS")?
                    .unwrap_or(DEFAULT_UPLOAD_URL_TTL_SECS),
            },
            download_cache_ttl_secs: match args.download_cache_ttl_secs {
                Some(v) => v,
                None => env_u64("OBJECT_GATEWAY_DOWNLOAD_CACHE_TTL_SECS")?
                    .unwrap_or(DEFAULT_DOWNLOAD_CACHE_TTL_SECS),
            },
            group_file: args.group_file.or_else(|| lookup("OBJECT_GATEWAY_GROUP_FILE")),
            host,
            port,
        })
    }

    /// Startup checks for settings every request depends on.
    pub fn validate(&self) -> StorageResult<()> {
        if self.default_bucket.trim().is_empty() {
            return Err(StorageError::Configuration(
                "OBJECT_GATEWAY_DEFAULT_BUCKET must be set".into(),
            ));
        }
        if self.private_object_dir.trim().is_empty() {
            return Err(StorageError::Configuration(
                "PRIVATE_OBJECT_DIR must be set".into(),
            ));
        }
        if self.signing_secret.len() < MIN_SIGNING_SECRET_LEN {
            return Err(StorageError::Configuration(format!(
                "OBJECT_GATEWAY_SIGNING_SECRET must be at least {} bytes",
                MIN_SIGNING_SECRET_LEN
            )));
        }
        if self.upload_url_ttl_secs == 0 || self.upload_url_ttl_secs > MAX_UPLOAD_URL_TTL_SECS {
            return Err(StorageError::Configuration(format!(
                "upload url ttl must be between 1 and {} seconds",
                MAX_UPLOAD_URL_TTL_SECS
            )));
        }
        Ok(())
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            default_bucket: self.default_bucket.clone(),
            private_object_dir: self.private_object_dir.clone(),
            public_object_search_paths: self.public_object_search_paths.clone(),
            upload_url_ttl_secs: self.upload_url_ttl_secs,
            download_cache_ttl_secs: self.download_cache_ttl_secs,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_search_paths(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
