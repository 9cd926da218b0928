//! src/services/storage_service.rs
//!
//! ObjectStorageService ties path resolution, ACL policies, capability
//! URLs and streaming together. Everything here is per-request; the only
//! shared state is the read-only configuration and the backend handle.

use crate::{
    backend::ObjectBackend,
    config::StorageConfig,
    errors::{StorageError, StorageResult},
    models::{
        acl::{AclPolicy, Permission},
        object::{ObjectMetadata, ObjectReference},
    },
    services::{
        access::{AccessEvaluator, GroupRegistry},
        acl_store::{AclPolicyStore, PolicySnapshot, policy_from_metadata},
        path_resolver::PathResolver,
        signer::{CAPABILITY_PATH_PREFIX, SignedUrlIssuer, SignedUrlRequest, decode_path},
        sink::{DownloadSink, ResponseHead},
        stream_adapter::{ByteStream, adapt},
    },
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Logical prefix of entity paths handed out to clients.
pub const ENTITY_PREFIX: &str = "/objects/";

const UPLOADS_DIR: &str = "uploads";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DOWNLOAD_FAILED: &str = "Error downloading file";

/// A freshly issued upload slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCapability {
    #[serde(rename = "uploadURL")]
    pub url: String,
    pub object_path: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ObjectStorageService {
    backend: Arc<dyn ObjectBackend>,
    resolver: PathResolver,
    acl: AclPolicyStore,
    evaluator: AccessEvaluator,
    signer: SignedUrlIssuer,
    config: Arc<StorageConfig>,
}

impl ObjectStorageService {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        config: StorageConfig,
        signer: SignedUrlIssuer,
        registry: GroupRegistry,
    ) -> Self {
        Self {
            resolver: PathResolver::new(config.default_bucket.clone()),
            acl: AclPolicyStore::new(backend.clone()),
            evaluator: AccessEvaluator::new(registry),
            backend,
            signer,
            config: Arc::new(config),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn signer(&self) -> &SignedUrlIssuer {
        &self.signer
    }

    pub fn resolve(&self, path: &str) -> StorageResult<ObjectReference> {
        self.resolver.resolve(path)
    }

    fn private_object_dir(&self) -> StorageResult<&str> {
        let dir = self.config.private_object_dir.trim_end_matches('/');
        if dir.is_empty() {
            return Err(StorageError::Configuration(
                "private object directory is not configured".into(),
            ));
        }
        Ok(dir)
    }

    /// Reserve a new private object and sign a PUT for it.
    pub fn issue_upload_capability(&self) -> StorageResult<UploadCapability> {
        let private_dir = self.private_object_dir()?;
        let object_id = Uuid::new_v4();
        let reference =
            self.resolve(&format!("{}/{}/{}", private_dir, UPLOADS_DIR, object_id))?;

        let ttl_seconds = self.config.upload_url_ttl_secs;
        let url = self.signer.sign(&SignedUrlRequest {
            bucket: reference.bucket.clone(),
            key: reference.key.clone(),
            method: Method::PUT,
            ttl_seconds,
        })?;

        debug!(object = %reference, ttl_seconds, "issued upload capability");
        Ok(UploadCapability {
            url,
            object_path: format!("{}{}/{}", ENTITY_PREFIX, UPLOADS_DIR, object_id),
            expires_at: Utc::now() + Duration::seconds(ttl_seconds as i64),
        })
    }

    /// Map `/objects/{id}` to the private object behind it.
    ///
    /// Every way of not finding the object looks the same to the caller.
    pub async fn resolve_entity(&self, logical_path: &str) -> StorageResult<ObjectReference> {
        let not_found = || StorageError::NotFound(logical_path.to_string());

        let Some(entity_id) = logical_path.strip_prefix(ENTITY_PREFIX) else {
            return Err(not_found());
        };
        if entity_id.split('/').all(str::is_empty) {
            return Err(not_found());
        }

        let private_dir = self.private_object_dir()?;
        let reference = match self.resolve(&format!("{}/{}", private_dir, entity_id)) {
            Ok(reference) => reference,
            Err(StorageError::InvalidPath(_)) => return Err(not_found()),
            Err(err) => return Err(err),
        };

        match self.backend.head(&reference).await {
            Ok(_) => Ok(reference),
            Err(StorageError::NotFound(_) | StorageError::InvalidPath(_)) => Err(not_found()),
            Err(err) => Err(err),
        }
    }

    /// Turn a capability URL we issued for a private object back into its
    /// `/objects/...` path. Anything else comes back unchanged.
    pub fn normalize_path(&self, raw: &str) -> String {
        if !(raw.starts_with("http://") || raw.starts_with("https://")) {
            return raw.to_string();
        }
        self.entity_path_for_url(raw).unwrap_or_else(|| raw.to_string())
    }

    fn entity_path_for_url(&self, url: &str) -> Option<String> {
        let storage_base = format!("{}{}", self.signer.base_url(), CAPABILITY_PATH_PREFIX);
        let rest = url.strip_prefix(&storage_base)?;
        let path = rest.split(['?', '#']).next()?;
        let path = decode_path(path)?;

        let private_prefix = self.private_storage_prefix().ok()?;
        let entity_id = path.strip_prefix(&private_prefix)?;
        if entity_id.is_empty() {
            return None;
        }
        Some(format!("{}{}", ENTITY_PREFIX, entity_id))
    }

    /// `/{bucket}/{key prefix}/` under which private objects are stored.
    ///
    /// Derived by resolving a child of the private directory, the same way
    /// upload capabilities are built, so that a single-segment directory
    /// such as `/media` maps to the `media` bucket root.
    fn private_storage_prefix(&self) -> StorageResult<String> {
        let private_dir = self.private_object_dir()?;
        let child = self.resolve(&format!("{}/{}", private_dir, UPLOADS_DIR))?;
        let key_root = child
            .key
            .strip_suffix(UPLOADS_DIR)
            .unwrap_or(&child.key)
            .trim_end_matches('/');
        Ok(if key_root.is_empty() {
            format!("/{}/", child.bucket)
        } else {
            format!("/{}/{}/", child.bucket, key_root)
        })
    }

    /// Probe each public search root in order; the first hit wins.
    pub async fn search_public_object(
        &self,
        file_path: &str,
    ) -> StorageResult<Option<ObjectReference>> {
        let file_path = file_path.trim_start_matches('/');
        if file_path.is_empty() {
            return Ok(None);
        }

        for root in &self.config.public_object_search_paths {
            let reference =
                match self.resolve(&format!("{}/{}", root.trim_end_matches('/'), file_path)) {
                    Ok(reference) => reference,
                    Err(StorageError::InvalidPath(_)) => continue,
                    Err(err) => return Err(err),
                };
            match self.backend.head(&reference).await {
                Ok(_) => return Ok(Some(reference)),
                Err(StorageError::NotFound(_) | StorageError::InvalidPath(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    pub async fn get_policy(&self, reference: &ObjectReference) -> StorageResult<Option<AclPolicy>> {
        self.acl.get_policy(reference).await
    }

    /// The stored policy together with what is needed to replace it safely.
    pub async fn policy_snapshot(&self, reference: &ObjectReference) -> StorageResult<PolicySnapshot> {
        self.acl.snapshot(reference).await
    }

    pub async fn set_policy(
        &self,
        reference: &ObjectReference,
        policy: &AclPolicy,
    ) -> StorageResult<()> {
        self.acl.set_policy(reference, policy).await
    }

    /// Attach `policy` to the entity behind `raw_path`.
    ///
    /// Paths that do not normalize to an entity path are external objects;
    /// they are returned as-is and nothing is written. With `expected`, the
    /// write fails with `Conflict` if the stored policy no longer matches it.
    pub async fn apply_policy(
        &self,
        raw_path: &str,
        policy: &AclPolicy,
        expected: Option<&PolicySnapshot>,
    ) -> StorageResult<String> {
        let normalized = self.normalize_path(raw_path);
        if !normalized.starts_with(ENTITY_PREFIX) {
            return Ok(normalized);
        }

        let reference = self.resolve_entity(&normalized).await?;
        match expected {
            Some(expected) => self.acl.replace_policy(&reference, policy, expected).await?,
            None => self.acl.set_policy(&reference, policy).await?,
        }
        Ok(normalized)
    }

    pub async fn authorize(
        &self,
        user_id: Option<&str>,
        policy: &AclPolicy,
        requested: Permission,
    ) -> StorageResult<bool> {
        self.evaluator.authorize(user_id, policy, requested).await
    }

    /// Objects without a policy are not accessible to anyone.
    pub async fn can_access(
        &self,
        user_id: Option<&str>,
        reference: &ObjectReference,
        requested: Permission,
    ) -> StorageResult<bool> {
        match self.acl.get_policy(reference).await? {
            Some(policy) => self.authorize(user_id, &policy, requested).await,
            None => Ok(false),
        }
    }

    /// Stream an object into `sink`.
    ///
    /// Failures before the head is committed become a generic 500 and an
    /// `Err`. Once the head is out, failures abort the body and are only
    /// logged; the call still returns `Ok`.
    pub async fn download<S>(&self, reference: &ObjectReference, sink: &mut S) -> StorageResult<()>
    where
        S: DownloadSink + ?Sized,
    {
        let (head, mut body) = match self.open_download(reference).await {
            Ok(opened) => opened,
            Err(err) => {
                error!(object = %reference, error = %err, "download failed before response");
                if !sink.is_committed() {
                    sink.fail(StatusCode::INTERNAL_SERVER_ERROR, DOWNLOAD_FAILED)
                        .await;
                }
                return Err(err);
            }
        };

        if let Err(err) = sink.commit(head).await {
            debug!(object = %reference, error = %err, "client went away before response head");
            return Ok(());
        }

        let mut sent: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!(object = %reference, sent, error = %err, "download aborted mid-stream");
                    sink.abort(err).await;
                    return Ok(());
                }
            };
            let len = chunk.len() as u64;
            if let Err(err) = sink.write(chunk).await {
                debug!(object = %reference, sent, error = %err, "download cancelled by client");
                return Ok(());
            }
            sent += len;
        }

        if let Err(err) = sink.finish().await {
            debug!(object = %reference, error = %err, "client went away at end of download");
            return Ok(());
        }
        info!(object = %reference, bytes = sent, "download complete");
        Ok(())
    }

    /// Status and headers a download of `reference` would start with.
    pub async fn response_head(&self, reference: &ObjectReference) -> StorageResult<ResponseHead> {
        let meta = self.backend.head(reference).await?;
        Ok(self.head_for(reference, &meta))
    }

    fn head_for(&self, reference: &ObjectReference, meta: &ObjectMetadata) -> ResponseHead {
        let is_public = policy_from_metadata(reference, meta).is_some_and(|p| p.is_public());
        ResponseHead {
            status: StatusCode::OK,
            headers: download_headers(meta, is_public, self.config.download_cache_ttl_secs),
        }
    }

    /// Headers come from the same read as the body so they always agree.
    async fn open_download(
        &self,
        reference: &ObjectReference,
    ) -> StorageResult<(ResponseHead, ByteStream)> {
        let (meta, body) = self.backend.get(reference).await?;
        debug!(object = %reference, body = body.kind(), "opened backend body");
        Ok((self.head_for(reference, &meta), adapt(body)))
    }
}

fn download_headers(meta: &ObjectMetadata, is_public: bool, max_age: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = meta
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(size) = meta.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    let visibility = if is_public { "public" } else { "private" };
    if let Ok(value) = HeaderValue::from_str(&format!("{}, max-age={}", visibility, max_age)) {
        headers.insert(header::CACHE_CONTROL, value);
    }

    let optional = [
        (header::ETAG, meta.etag.as_ref().map(|etag| format!("\"{}\"", etag))),
        (header::CONTENT_ENCODING, meta.content_encoding.clone()),
        (header::CONTENT_DISPOSITION, meta.content_disposition.clone()),
    ];
    for (name, value) in optional {
        if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(name, value);
        }
    }

    headers
}
