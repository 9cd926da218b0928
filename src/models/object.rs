//! Represents a backend object address and the metadata read back from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Identifies one backend object.
///
/// Built per request from a path and never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    /// Bucket holding the object.
    pub bucket: String,

    /// Object key within the bucket (may contain `/`).
    pub key: String,
}

impl ObjectReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Absolute backend path, `/{bucket}/{key}`.
    pub fn to_path(&self) -> String {
        format!("/{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// HTTP metadata headers carried alongside an object.
///
/// These must survive a metadata replace, so they travel as one unit.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentHeaders {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
}

/// Metadata returned by a backend HEAD. Never cached across requests.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes, when the backend knows it.
    pub size: Option<u64>,

    /// User-defined string metadata (including the reserved policy field).
    pub custom_metadata: BTreeMap<String, String>,

    pub cache_control: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,

    /// Content checksum as reported by the backend.
    pub etag: Option<String>,

    /// Metadata generation; changes on every write, used for preconditions.
    pub version: Option<String>,

    /// Timestamp when the object was last modified.
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    pub fn content_headers(&self) -> ContentHeaders {
        ContentHeaders {
            content_type: self.content_type.clone(),
            cache_control: self.cache_control.clone(),
            content_encoding: self.content_encoding.clone(),
            content_disposition: self.content_disposition.clone(),
        }
    }
}

/// A copy-to-self request replacing all metadata of an existing object.
#[derive(Clone, Debug, Default)]
pub struct MetadataReplace {
    pub headers: ContentHeaders,
    pub custom_metadata: BTreeMap<String, String>,

    /// Only apply when the stored version still equals this value.
    pub if_version_match: Option<String>,
}
