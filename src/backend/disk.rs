//! Local-disk backend.
//!
//! Durable metadata lives in SQLite; payloads live on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. Custom metadata is stored as
//! a JSON object column, and every write bumps a `generation` counter that
//! serves as the object's version for conditional metadata replaces.

use crate::{
    backend::ObjectBackend,
    errors::{StorageError, StorageResult},
    models::object::{ContentHeaders, MetadataReplace, ObjectMetadata, ObjectReference},
    services::stream_adapter::{BackendBody, ByteStream},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use sqlx::{FromRow, SqlitePool};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "bucket, key, content_type, cache_control, content_encoding, \
     content_disposition, size_bytes, etag, generation, metadata, last_modified";

#[derive(Debug, FromRow)]
struct ObjectRow {
    bucket: String,
    key: String,
    content_type: Option<String>,
    cache_control: Option<String>,
    content_encoding: Option<String>,
    content_disposition: Option<String>,
    size_bytes: i64,
    etag: String,
    generation: i64,
    metadata: String,
    last_modified: DateTime<Utc>,
}

impl ObjectRow {
    fn into_metadata(self) -> StorageResult<ObjectMetadata> {
        let custom_metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|err| {
                StorageError::Backend(format!(
                    "corrupt metadata column for {}/{}: {}",
                    self.bucket, self.key, err
                ))
            })?;

        Ok(ObjectMetadata {
            content_type: self.content_type,
            size: u64::try_from(self.size_bytes).ok(),
            custom_metadata,
            cache_control: self.cache_control,
            content_encoding: self.content_encoding,
            content_disposition: self.content_disposition,
            etag: Some(self.etag),
            version: Some(self.generation.to_string()),
            last_modified: Some(self.last_modified),
        })
    }
}

#[derive(Clone, Debug)]
pub struct DiskBackend {
    /// Shared SQLite connection pool used for metadata operations.
    db: SqlitePool,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
}

impl DiskBackend {
    pub fn new(db: SqlitePool, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    ///
    /// This does not check for existence. Used for building object paths
    /// and as the stop point when pruning empty directories.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00-ff). Keeps the file count per directory low.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path: base_path/bucket/{shard}/{shard}/{key}.
    ///
    /// Parent directories may not exist yet.
    fn object_path(&self, reference: &ObjectReference) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&reference.bucket, &reference.key);
        let mut path = self.bucket_root(&reference.bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(&reference.key);
        path
    }

    async fn fetch_row(&self, reference: &ObjectReference) -> StorageResult<ObjectRow> {
        let sql = format!(
            "SELECT {} FROM objects WHERE bucket = ? AND key = ?",
            OBJECT_COLUMNS
        );
        sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(&reference.bucket)
            .bind(&reference.key)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    /// Recursively remove empty directories up to bucket root.
    ///
    /// Stops when:
    /// - a directory is not empty
    /// - a directory is already gone
    /// - `stop` is reached
    /// - any other I/O error occurs (logged at debug)
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Reject keys that could escape the bucket directory.
fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidPath(format!("invalid object key `{}`", key));
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(invalid());
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    Ok(())
}

/// Enforce S3-like bucket naming so the directory layout stays predictable.
fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
    let invalid =
        |reason: &str| StorageError::InvalidPath(format!("bucket `{}` invalid: {}", name, reason));

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

fn ensure_reference_safe(reference: &ObjectReference) -> StorageResult<()> {
    ensure_bucket_name_safe(&reference.bucket)?;
    ensure_key_safe(&reference.key)
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

fn encode_metadata(custom: &BTreeMap<String, String>) -> StorageResult<String> {
    serde_json::to_string(custom)
        .map_err(|err| StorageError::Backend(format!("encoding metadata: {}", err)))
}

#[async_trait]
impl ObjectBackend for DiskBackend {
    async fn head(&self, reference: &ObjectReference) -> StorageResult<ObjectMetadata> {
        ensure_reference_safe(reference)?;
        self.fetch_row(reference).await?.into_metadata()
    }

    async fn get(
        &self,
        reference: &ObjectReference,
    ) -> StorageResult<(ObjectMetadata, BackendBody)> {
        ensure_reference_safe(reference)?;
        let meta = self.fetch_row(reference).await?.into_metadata()?;

        let file_path = self.object_path(reference);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(reference.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((meta, BackendBody::Reader(Box::new(file))))
    }

    /// Stream the body into a temp file and fsync it, then swap it in under
    /// an open transaction.
    ///
    /// The row is upserted first. The previous payload, if any, is moved
    /// aside and only removed once the transaction commits, so a failed
    /// write leaves the old payload and row untouched.
    async fn put(
        &self,
        reference: &ObjectReference,
        mut body: ByteStream,
        headers: ContentHeaders,
        custom_metadata: BTreeMap<String, String>,
    ) -> StorageResult<ObjectMetadata> {
        ensure_reference_safe(reference)?;

        let file_path = self.object_path(reference);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let written = match chunk_res {
                Ok(chunk) => {
                    size_bytes += chunk.len() as i64;
                    digest.consume(&chunk);
                    file.write_all(&chunk).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await
        {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        let etag = format!("{:x}", digest.compute());
        let sql = format!(
            r#"
            INSERT INTO objects (
                bucket, key, content_type, cache_control, content_encoding,
                content_disposition, size_bytes, etag, generation, metadata, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                cache_control = excluded.cache_control,
                content_encoding = excluded.content_encoding,
                content_disposition = excluded.content_disposition,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                generation = objects.generation + 1,
                metadata = excluded.metadata,
                last_modified = excluded.last_modified
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        );

        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let encoded = match encode_metadata(&custom_metadata) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(&reference.bucket)
            .bind(&reference.key)
            .bind(headers.content_type)
            .bind(headers.cache_control)
            .bind(headers.content_encoding)
            .bind(headers.content_disposition)
            .bind(size_bytes)
            .bind(&etag)
            .bind(encoded)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let backup_path = parent.join(format!(".bak-{}", Uuid::new_v4()));
        let backed_up = match fs::rename(&file_path, &backup_path).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            if backed_up {
                let _ = fs::rename(&backup_path, &file_path).await;
            }
            return Err(StorageError::Io(err));
        }

        if let Err(err) = tx.commit().await {
            let _ = fs::remove_file(&file_path).await;
            if backed_up {
                let _ = fs::rename(&backup_path, &file_path).await;
            }
            return Err(StorageError::Sqlx(err));
        }

        if backed_up {
            if let Err(err) = fs::remove_file(&backup_path).await {
                debug!("failed to remove replaced payload {}: {}", backup_path.display(), err);
            }
        }
        row.into_metadata()
    }

    async fn copy_in_place(
        &self,
        reference: &ObjectReference,
        update: MetadataReplace,
    ) -> StorageResult<ObjectMetadata> {
        ensure_reference_safe(reference)?;

        let expected_generation = match &update.if_version_match {
            Some(version) => Some(version.parse::<i64>().map_err(|_| {
                StorageError::PreconditionFailed(reference.to_string())
            })?),
            None => None,
        };

        let sql = format!(
            "UPDATE objects SET
                content_type = ?, cache_control = ?, content_encoding = ?,
                content_disposition = ?, metadata = ?, last_modified = ?,
                generation = generation + 1
             WHERE bucket = ? AND key = ? AND (? IS NULL OR generation = ?)
             RETURNING {}",
            OBJECT_COLUMNS
        );

        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(update.headers.content_type)
            .bind(update.headers.cache_control)
            .bind(update.headers.content_encoding)
            .bind(update.headers.content_disposition)
            .bind(encode_metadata(&update.custom_metadata)?)
            .bind(Utc::now())
            .bind(&reference.bucket)
            .bind(&reference.key)
            .bind(expected_generation)
            .bind(expected_generation)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => row.into_metadata(),
            None => {
                // Distinguish a missing object from a lost precondition.
                self.fetch_row(reference).await?;
                Err(StorageError::PreconditionFailed(reference.to_string()))
            }
        }
    }

    async fn delete(&self, reference: &ObjectReference) -> StorageResult<()> {
        ensure_reference_safe(reference)?;

        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(&reference.bucket)
            .bind(&reference.key)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(reference.to_string()));
        }

        let file_path = self.object_path(reference);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&reference.bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    /// Runs `SELECT 1` and a write/read/delete round trip under `base_path`.
    async fn ping(&self) -> StorageResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.db)
            .await?;
        if one != 1 {
            return Err(StorageError::Backend(format!(
                "unexpected sqlite probe result: {}",
                one
            )));
        }

        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Backend("disk probe content mismatch".into()));
        }
        Ok(())
    }
}
