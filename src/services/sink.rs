//! Download destinations.
//!
//! A [`DownloadSink`] receives one response head followed by body chunks.
//! Closing the sink is the cancellation signal: once a write fails, the
//! producer stops and drops its backend stream.

use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream;
use serde_json::json;
use std::io;
use tokio::sync::{mpsc, oneshot};

/// Status line and headers committed before any body bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[async_trait]
pub trait DownloadSink: Send {
    /// True once a head has been committed.
    fn is_committed(&self) -> bool;

    async fn commit(&mut self, head: ResponseHead) -> io::Result<()>;

    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    async fn finish(&mut self) -> io::Result<()>;

    /// Report a failure before anything was committed.
    async fn fail(&mut self, status: StatusCode, message: &str);

    /// Tear down a response whose head is already out.
    async fn abort(&mut self, err: io::Error);
}

const BODY_CHANNEL_CAPACITY: usize = 8;

/// Sink that turns a download into an axum streaming [`Response`].
///
/// The response is delivered over a oneshot as soon as the head is
/// committed (or the download fails). Body chunks follow over a bounded
/// channel, so a slow client holds the producer back.
pub struct ChannelSink {
    response_tx: Option<oneshot::Sender<Response>>,
    body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl ChannelSink {
    pub fn new() -> (Self, oneshot::Receiver<Response>) {
        let (response_tx, response_rx) = oneshot::channel();
        (
            Self {
                response_tx: Some(response_tx),
                body_tx: None,
            },
            response_rx,
        )
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "download receiver closed")
    }
}

#[async_trait]
impl DownloadSink for ChannelSink {
    fn is_committed(&self) -> bool {
        self.response_tx.is_none()
    }

    async fn commit(&mut self, head: ResponseHead) -> io::Result<()> {
        let response_tx = self
            .response_tx
            .take()
            .ok_or_else(|| io::Error::other("response head already committed"))?;

        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let body = Body::from_stream(stream::unfold(body_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));

        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;

        response_tx.send(response).map_err(|_| Self::closed())?;
        self.body_tx = Some(body_tx);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        let body_tx = self.body_tx.as_ref().ok_or_else(Self::closed)?;
        body_tx.send(Ok(chunk)).await.map_err(|_| Self::closed())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.body_tx = None;
        Ok(())
    }

    async fn fail(&mut self, status: StatusCode, message: &str) {
        if let Some(response_tx) = self.response_tx.take() {
            let body = Json(json!({ "error": message, "status": status.as_u16() }));
            let _ = response_tx.send((status, body).into_response());
        }
    }

    async fn abort(&mut self, err: io::Error) {
        // An error item makes hyper reset the connection instead of ending
        // the body cleanly.
        if let Some(body_tx) = self.body_tx.take() {
            let _ = body_tx.send(Err(err)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};
    use http_body_util::BodyExt;

    fn head() -> ResponseHead {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        ResponseHead {
            status: StatusCode::OK,
            headers,
        }
    }

    #[tokio::test]
    async fn committed_response_streams_written_chunks() {
        let (mut sink, response_rx) = ChannelSink::new();
        assert!(!sink.is_committed());

        let producer = tokio::spawn(async move {
            sink.commit(head()).await.unwrap();
            assert!(sink.is_committed());
            sink.write(Bytes::from_static(b"hello ")).await.unwrap();
            sink.write(Bytes::from_static(b"sink")).await.unwrap();
            sink.finish().await.unwrap();
        });

        let response = response_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello sink");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn fail_before_commit_sends_error_response() {
        let (mut sink, response_rx) = ChannelSink::new();
        sink.fail(StatusCode::INTERNAL_SERVER_ERROR, "Error downloading file")
            .await;

        let response = response_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn dropped_receiver_fails_writes() {
        let (mut sink, response_rx) = ChannelSink::new();
        sink.commit(head()).await.unwrap();
        drop(response_rx);

        let err = sink.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn abort_after_commit_errors_the_body() {
        let (mut sink, response_rx) = ChannelSink::new();
        sink.commit(head()).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort(io::Error::other("backend went away")).await;

        let response = response_rx.await.unwrap();
        assert!(response.into_body().collect().await.is_err());
    }
}
