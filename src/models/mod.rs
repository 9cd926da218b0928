//! Core data models for the object gateway.
//!
//! Object references and metadata mirror what the backend reports; ACL
//! types serialize naturally as JSON via `serde` into object metadata.

pub mod acl;
pub mod object;
