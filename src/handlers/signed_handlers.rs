//! Capability-URL endpoints under `/storage/{bucket}/{*key}`.
//!
//! Every request must carry `expires` and `signature` query parameters
//! issued for exactly this method, bucket and key. Bodies are streamed in
//! both directions.

use crate::{
    errors::AppError,
    handlers::stream_object,
    models::object::{ContentHeaders, ObjectReference},
    services::{
        signer::CapabilityQuery, storage_service::ObjectStorageService, stream_adapter::ByteStream,
    },
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use std::{collections::BTreeMap, io};

fn authorized_reference(
    service: &ObjectStorageService,
    method: &Method,
    bucket: String,
    key: String,
    query: &CapabilityQuery,
) -> Result<ObjectReference, AppError> {
    if let Err(err) = service.signer().verify(method, &bucket, &key, query) {
        tracing::debug!(%bucket, %key, %method, error = %err, "capability rejected");
        return Err(err.into());
    }
    Ok(ObjectReference::new(bucket, key))
}

/// PUT `/storage/{bucket}/{*key}` — upload through a signed URL.
pub async fn put_signed(
    State(service): State<ObjectStorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<CapabilityQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let reference = authorized_reference(&service, &Method::PUT, bucket, key, &query)?;

    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };
    let content_headers = ContentHeaders {
        content_type: header_str(header::CONTENT_TYPE),
        cache_control: header_str(header::CACHE_CONTROL),
        content_encoding: header_str(header::CONTENT_ENCODING),
        content_disposition: header_str(header::CONTENT_DISPOSITION),
    };

    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );

    let meta = service
        .backend()
        .put(&reference, stream, content_headers, BTreeMap::new())
        .await?;
    tracing::info!(object = %reference, size = ?meta.size, "object uploaded via capability");

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            response.headers_mut().insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// GET `/storage/{bucket}/{*key}` — streaming download through a signed URL.
pub async fn get_signed(
    State(service): State<ObjectStorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<CapabilityQuery>,
) -> Result<Response, AppError> {
    let reference = authorized_reference(&service, &Method::GET, bucket, key, &query)?;
    // A missing object is a 404 here, not a failed download.
    if !service.backend().exists(&reference).await? {
        return Err(AppError::not_found("Object not found"));
    }
    stream_object(service, reference).await
}

/// HEAD `/storage/{bucket}/{*key}` — same headers as GET but no body.
pub async fn head_signed(
    State(service): State<ObjectStorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<CapabilityQuery>,
) -> Result<Response, AppError> {
    let reference = authorized_reference(&service, &Method::HEAD, bucket, key, &query)?;
    let head = service.response_head(&reference).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    Ok(response)
}

/// DELETE `/storage/{bucket}/{*key}`.
pub async fn delete_signed(
    State(service): State<ObjectStorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<CapabilityQuery>,
) -> Result<StatusCode, AppError> {
    let reference = authorized_reference(&service, &Method::DELETE, bucket, key, &query)?;
    service.backend().delete(&reference).await?;
    tracing::info!(object = %reference, "object deleted via capability");
    Ok(StatusCode::NO_CONTENT)
}
