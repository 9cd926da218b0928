//! Access-controlled object storage gateway.
//!
//! Resolves logical object paths to backend `(bucket, key)` pairs, keeps an
//! ACL policy in each object's custom metadata, issues HMAC-signed
//! capability URLs and streams downloads with consistent headers.

pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
