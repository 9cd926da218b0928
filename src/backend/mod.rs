//! Object-storage backends the gateway is a client of.
//!
//! The gateway never stores bytes itself; it talks to an [`ObjectBackend`]
//! that provides HEAD, GET, PUT, copy-in-place with metadata replace and
//! DELETE, plus a per-object string map of custom metadata.

pub mod disk;
pub mod memory;

use crate::{
    errors::{StorageError, StorageResult},
    models::object::{ContentHeaders, MetadataReplace, ObjectMetadata, ObjectReference},
    services::stream_adapter::{BackendBody, ByteStream},
};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Fetch metadata; fails with `NotFound` when the object is absent.
    async fn head(&self, reference: &ObjectReference) -> StorageResult<ObjectMetadata>;

    /// Fetch metadata and an open body.
    async fn get(&self, reference: &ObjectReference)
    -> StorageResult<(ObjectMetadata, BackendBody)>;

    /// Create or overwrite an object from a byte stream.
    async fn put(
        &self,
        reference: &ObjectReference,
        body: ByteStream,
        headers: ContentHeaders,
        custom_metadata: BTreeMap<String, String>,
    ) -> StorageResult<ObjectMetadata>;

    /// Copy an existing object onto itself, replacing all of its metadata.
    ///
    /// Never creates an object. Fails with `PreconditionFailed` when
    /// `if_version_match` is set and no longer matches.
    async fn copy_in_place(
        &self,
        reference: &ObjectReference,
        update: MetadataReplace,
    ) -> StorageResult<ObjectMetadata>;

    async fn delete(&self, reference: &ObjectReference) -> StorageResult<()>;

    async fn exists(&self, reference: &ObjectReference) -> StorageResult<bool> {
        match self.head(reference).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> StorageResult<()>;
}
