use anyhow::{Context, Result};
use axum::Router;
use object_gateway::{
    backend::{DiskBackend, MemoryBackend, ObjectBackend},
    config::{AppConfig, BackendKind},
    routes,
    services::{
        access::{GroupRegistry, StaticMembership},
        signer::SignedUrlIssuer,
        storage_service::ObjectStorageService,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    // --- Initialize backend ---
    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::Disk => {
            let disk = open_disk_backend(&cfg).await?;
            disk.migrate().await.context("running migrations")?;
            tracing::info!("Disk backend rooted at {}", disk.base_path().display());
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            Arc::new(disk)
        }
        BackendKind::Memory => {
            if migrate {
                tracing::warn!("--migrate has no effect with the memory backend");
                return Ok(());
            }
            tracing::warn!("Using the in-memory backend; objects are lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };

    // Required settings fail here rather than on the first request.
    cfg.validate()?;

    // --- Membership checkers ---
    let mut registry = GroupRegistry::new();
    if let Some(path) = cfg.group_file.as_deref() {
        let membership = StaticMembership::load(path).await?;
        registry = registry.register(StaticMembership::GROUP_TYPE, Arc::new(membership));
        tracing::info!("Loaded static group memberships from {}", path);
    }

    // --- Initialize core service ---
    let signer = SignedUrlIssuer::new(cfg.signing_secret.as_bytes(), cfg.public_base_url.clone());
    let storage = ObjectStorageService::new(backend, cfg.storage_config(), signer, registry);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Prepare the storage dir and SQLite file, then open the pool.
async fn open_disk_backend(cfg: &AppConfig) -> Result<DiskBackend> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the database file on its own.
    if db_path != ":memory:" {
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open database file {}: {}", db_path, e);
        }
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(DiskBackend::new(db, cfg.storage_dir.clone()))
}
