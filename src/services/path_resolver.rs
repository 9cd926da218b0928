//! Turns logical path strings into `(bucket, key)` references.

use crate::{
    errors::{StorageError, StorageResult},
    models::object::ObjectReference,
};

const SEPARATOR: char = '/';

/// Pure resolver from a path string to an [`ObjectReference`].
///
/// Relative paths land in the default bucket. Absolute paths name their
/// bucket in the first segment, unless they only have one segment.
#[derive(Clone, Debug)]
pub struct PathResolver {
    default_bucket: String,
}

impl PathResolver {
    pub fn new(default_bucket: impl Into<String>) -> Self {
        Self {
            default_bucket: default_bucket.into(),
        }
    }

    pub fn resolve(&self, path: &str) -> StorageResult<ObjectReference> {
        if self.default_bucket.is_empty() {
            return Err(StorageError::Configuration(
                "default bucket is not configured".into(),
            ));
        }
        if path.is_empty() {
            return Err(StorageError::InvalidPath("path is empty".into()));
        }

        if !path.starts_with(SEPARATOR) {
            return Ok(ObjectReference::new(self.default_bucket.clone(), path));
        }

        let segments: Vec<&str> = path.split(SEPARATOR).filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Err(StorageError::InvalidPath(format!(
                "`{}` has no path segments",
                path
            ))),
            [only] => Ok(ObjectReference::new(self.default_bucket.clone(), *only)),
            [bucket, rest @ ..] => Ok(ObjectReference::new(*bucket, rest.join("/"))),
        }
    }
}
