//! In-memory backend.
//!
//! Keeps payloads and metadata in process memory. Versions come from a
//! shared generation counter, so conditional metadata replaces behave like
//! the disk backend's. Used by tests and by `--backend memory`.

use crate::{
    backend::ObjectBackend,
    errors::{StorageError, StorageResult},
    models::object::{ContentHeaders, MetadataReplace, ObjectMetadata, ObjectReference},
    services::stream_adapter::{BackendBody, ByteStream},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::RwLock;

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMetadata,
}

/// In-memory backend.
///
/// Objects live in a `BTreeMap` keyed by `(bucket, key)`. Bodies are served
/// as a native chunked stream so downloads exercise the same path as a
/// real network backend.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<BTreeMap<(String, String), StoredObject>>>,
    generation: Arc<AtomicU64>,
    chunk_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            generation: Arc::new(AtomicU64::new(1)),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Convenience for seeding objects from a byte slice.
    pub async fn insert(
        &self,
        reference: &ObjectReference,
        data: impl Into<Bytes>,
        headers: ContentHeaders,
        custom_metadata: BTreeMap<String, String>,
    ) -> ObjectMetadata {
        let data = data.into();
        let meta = self.metadata_for(&data, headers, custom_metadata);
        let mut objects = self.objects.write().await;
        objects.insert(
            key_of(reference),
            StoredObject {
                data,
                meta: meta.clone(),
            },
        );
        meta
    }

    fn next_version(&self) -> String {
        self.generation.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn metadata_for(
        &self,
        data: &Bytes,
        headers: ContentHeaders,
        custom_metadata: BTreeMap<String, String>,
    ) -> ObjectMetadata {
        ObjectMetadata {
            content_type: headers.content_type,
            size: Some(data.len() as u64),
            custom_metadata,
            cache_control: headers.cache_control,
            content_encoding: headers.content_encoding,
            content_disposition: headers.content_disposition,
            etag: Some(format!("{:x}", md5::compute(data))),
            version: Some(self.next_version()),
            last_modified: Some(Utc::now()),
        }
    }
}

fn key_of(reference: &ObjectReference) -> (String, String) {
    (reference.bucket.clone(), reference.key.clone())
}

fn not_found(reference: &ObjectReference) -> StorageError {
    StorageError::NotFound(reference.to_string())
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head(&self, reference: &ObjectReference) -> StorageResult<ObjectMetadata> {
        let objects = self.objects.read().await;
        objects
            .get(&key_of(reference))
            .map(|o| o.meta.clone())
            .ok_or_else(|| not_found(reference))
    }

    async fn get(
        &self,
        reference: &ObjectReference,
    ) -> StorageResult<(ObjectMetadata, BackendBody)> {
        let stored = {
            let objects = self.objects.read().await;
            objects
                .get(&key_of(reference))
                .cloned()
                .ok_or_else(|| not_found(reference))?
        };

        let data = stored.data;
        let chunk_size = self.chunk_size;
        let chunks = (0..data.len())
            .step_by(chunk_size)
            .map(move |start| Ok(data.slice(start..(start + chunk_size).min(data.len()))));
        let chunks: Vec<io::Result<Bytes>> = chunks.collect();
        let body: ByteStream = Box::pin(stream::iter(chunks));

        Ok((stored.meta, BackendBody::Native(body)))
    }

    async fn put(
        &self,
        reference: &ObjectReference,
        mut body: ByteStream,
        headers: ContentHeaders,
        custom_metadata: BTreeMap<String, String>,
    ) -> StorageResult<ObjectMetadata> {
        if reference.bucket.is_empty() || reference.key.is_empty() {
            return Err(StorageError::InvalidPath(reference.to_string()));
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }

        Ok(self
            .insert(reference, buf.freeze(), headers, custom_metadata)
            .await)
    }

    async fn copy_in_place(
        &self,
        reference: &ObjectReference,
        update: MetadataReplace,
    ) -> StorageResult<ObjectMetadata> {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(&key_of(reference))
            .ok_or_else(|| not_found(reference))?;

        if let Some(expected) = &update.if_version_match {
            if stored.meta.version.as_ref() != Some(expected) {
                return Err(StorageError::PreconditionFailed(reference.to_string()));
            }
        }

        let meta = &mut stored.meta;
        meta.content_type = update.headers.content_type;
        meta.cache_control = update.headers.cache_control;
        meta.content_encoding = update.headers.content_encoding;
        meta.content_disposition = update.headers.content_disposition;
        meta.custom_metadata = update.custom_metadata;
        meta.version = Some(self.next_version());
        meta.last_modified = Some(Utc::now());

        Ok(meta.clone())
    }

    async fn delete(&self, reference: &ObjectReference) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        objects
            .remove(&key_of(reference))
            .map(|_| ())
            .ok_or_else(|| not_found(reference))
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}
