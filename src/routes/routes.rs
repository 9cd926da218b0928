//! Defines routes for the gateway.
//!
//! ## Structure
//! - **Application endpoints** (caller identity from `x-user-id`)
//!   - `POST   /api/uploads` — issue a signed upload URL
//!   - `PUT    /api/objects/acl` — set the ACL policy of an uploaded object
//!   - `GET    /objects/{*path}` — policy-checked download of a private object
//!   - `GET    /public-objects/{*path}` — download from the public search roots
//!
//! - **Capability endpoints** (`?expires=&signature=` required)
//!   - `PUT    /storage/{bucket}/{*key}` — upload object
//!   - `GET    /storage/{bucket}/{*key}` — download object
//!   - `HEAD   /storage/{bucket}/{*key}` — retrieve metadata only
//!   - `DELETE /storage/{bucket}/{*key}` — delete object
//!
//! The wildcard `*key` allows nested keys like `.private/uploads/{id}`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{create_upload_url, get_entity_object, get_public_object, set_object_acl},
        signed_handlers::{delete_signed, get_signed, head_signed, put_signed},
    },
    services::storage_service::ObjectStorageService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router; handlers share the `ObjectStorageService` state.
pub fn routes() -> Router<ObjectStorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // application API
        .route("/api/uploads", post(create_upload_url))
        .route("/api/objects/acl", put(set_object_acl))
        .route("/objects/{*path}", get(get_entity_object))
        .route("/public-objects/{*path}", get(get_public_object))
        // capability URLs
        .route(
            "/storage/{bucket}/{*key}",
            put(put_signed)
                .get(get_signed)
                .head(head_signed)
                .delete(delete_signed),
        )
}
