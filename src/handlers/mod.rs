pub mod health_handlers;
pub mod object_handlers;
pub mod signed_handlers;

use crate::{
    errors::AppError,
    models::object::ObjectReference,
    services::{sink::ChannelSink, storage_service::ObjectStorageService},
};
use axum::{http::HeaderMap, response::Response};

/// Opaque caller identity supplied by the fronting auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

pub(crate) fn caller_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Run a download on its own task and hand back the streaming response.
pub(crate) async fn stream_object(
    service: ObjectStorageService,
    reference: ObjectReference,
) -> Result<Response, AppError> {
    let (mut sink, response_rx) = ChannelSink::new();
    tokio::spawn(async move {
        // Failures are logged by the service and already reported via the sink.
        let _ = service.download(&reference, &mut sink).await;
    });
    response_rx
        .await
        .map_err(|_| AppError::internal("Error downloading file"))
}
