//! HTTP handlers for application-facing object operations: upload slots,
//! ACL updates and policy-checked downloads.

use crate::{
    errors::AppError,
    handlers::{caller_id, stream_object},
    models::acl::{AclPolicy, AclRule, Permission, Visibility},
    services::storage_service::{ENTITY_PREFIX, ObjectStorageService, UploadCapability},
};
use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use serde::{Deserialize, Serialize};

/// Body of `PUT /api/objects/acl`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAclRequest {
    #[serde(rename = "objectURL")]
    pub object_url: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub acl_rules: Vec<AclRule>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAclResponse {
    pub object_path: String,
}

/// POST `/api/uploads` — hand out a signed PUT URL for a fresh private object.
pub async fn create_upload_url(
    State(service): State<ObjectStorageService>,
    headers: HeaderMap,
) -> Result<Json<UploadCapability>, AppError> {
    let user_id = caller_id(&headers).ok_or_else(AppError::unauthorized)?;
    let capability = service.issue_upload_capability()?;
    tracing::info!(user = %user_id, object = %capability.object_path, "upload url issued");
    Ok(Json(capability))
}

/// PUT `/api/objects/acl` — attach an ACL policy to an uploaded object.
///
/// A first policy makes the caller the owner. Replacing an existing policy
/// needs WRITE under it and keeps the original owner. If the policy changes
/// between the check and the write, the request fails with 409.
pub async fn set_object_acl(
    State(service): State<ObjectStorageService>,
    headers: HeaderMap,
    Json(req): Json<SetAclRequest>,
) -> Result<Json<SetAclResponse>, AppError> {
    let user_id = caller_id(&headers).ok_or_else(AppError::unauthorized)?;

    let normalized = service.normalize_path(&req.object_url);
    if !normalized.starts_with(ENTITY_PREFIX) {
        return Ok(Json(SetAclResponse {
            object_path: normalized,
        }));
    }

    // The write below only lands if the policy is still the one checked here.
    let reference = service.resolve_entity(&normalized).await?;
    let snapshot = service.policy_snapshot(&reference).await?;
    let owner = match &snapshot.policy {
        Some(existing) => {
            if !service
                .authorize(Some(&user_id), existing, Permission::Write)
                .await?
            {
                return Err(AppError::forbidden());
            }
            existing.owner.clone()
        }
        None => user_id,
    };

    let policy = AclPolicy {
        owner,
        visibility: req.visibility,
        acl_rules: req.acl_rules,
    };
    let object_path = service
        .apply_policy(&normalized, &policy, Some(&snapshot))
        .await?;
    Ok(Json(SetAclResponse { object_path }))
}

/// GET `/objects/{*path}` — download a private object the caller may read.
pub async fn get_entity_object(
    State(service): State<ObjectStorageService>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = caller_id(&headers);
    let logical_path = format!("{}{}", ENTITY_PREFIX, path.trim_start_matches('/'));
    let reference = service.resolve_entity(&logical_path).await?;

    if !service
        .can_access(user_id.as_deref(), &reference, Permission::Read)
        .await?
    {
        return Err(match user_id {
            Some(_) => AppError::forbidden(),
            None => AppError::unauthorized(),
        });
    }

    stream_object(service, reference).await
}

/// GET `/public-objects/{*path}` — first match across the public search roots.
pub async fn get_public_object(
    State(service): State<ObjectStorageService>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let reference = service
        .search_public_object(&path)
        .await?
        .ok_or_else(|| AppError::not_found("File not found"))?;
    stream_object(service, reference).await
}
