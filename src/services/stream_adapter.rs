//! Normalizes backend response bodies into one byte-stream contract.
//!
//! Backends hand bodies back in whatever shape is natural for them. Every
//! shape is bridged into a [`ByteStream`] whose chunks concatenate to the
//! exact object bytes. A stream ends with at most one terminal signal
//! (`None`, or a single `Err`) and yields nothing afterwards. Dropping the
//! adapted stream drops the backend reader with it.

use bytes::Bytes;
use futures::{Stream, stream};
use std::{
    fmt,
    io::{self, Read},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{io::AsyncRead, sync::mpsc};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// The canonical body type handed to HTTP responses and sinks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Shapes a backend may use for an object body, in preference order.
pub enum BackendBody {
    /// Already a byte stream; passed through untouched.
    Native(ByteStream),
    /// Chunks pushed by a producer task over a bounded channel.
    Chunks(mpsc::Receiver<io::Result<Bytes>>),
    /// Pull-style async reader.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Blocking reader; drained completely before anything is emitted.
    Pipe(Box<dyn Read + Send>),
    /// Payload already held in memory.
    Buffered(Bytes),
}

impl BackendBody {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendBody::Native(_) => "native",
            BackendBody::Chunks(_) => "chunks",
            BackendBody::Reader(_) => "reader",
            BackendBody::Pipe(_) => "pipe",
            BackendBody::Buffered(_) => "buffered",
        }
    }
}

impl fmt::Debug for BackendBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackendBody").field(&self.kind()).finish()
    }
}

/// Bridge any [`BackendBody`] into a [`ByteStream`].
pub fn adapt(body: BackendBody) -> ByteStream {
    let stream: ByteStream = match body {
        BackendBody::Native(stream) => stream,
        BackendBody::Chunks(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })),
        BackendBody::Reader(reader) => {
            Box::pin(ReaderStream::with_capacity(reader, READ_CHUNK_SIZE))
        }
        BackendBody::Pipe(reader) => {
            warn!("backend body is a blocking pipe; buffering whole payload before streaming");
            Box::pin(stream::once(read_fully(reader)))
        }
        BackendBody::Buffered(bytes) => {
            debug!(len = bytes.len(), "emitting buffered backend body");
            Box::pin(stream::iter([Ok::<_, io::Error>(bytes)]))
        }
    };

    Box::pin(Terminated::new(stream))
}

async fn read_fully(mut reader: Box<dyn Read + Send>) -> io::Result<Bytes> {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(io::Error::other)?
}

/// Enforces the single-terminal-signal rule and drops empty chunks.
///
/// The inner stream is dropped as soon as it ends or fails, which closes
/// the backend reader.
struct Terminated {
    inner: Option<ByteStream>,
}

impl Terminated {
    fn new(inner: ByteStream) -> Self {
        Self { inner: Some(inner) }
    }
}

impl Stream for Terminated {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) if chunk.is_empty() => continue,
                Poll::Ready(Some(Ok(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(Some(Err(err))) => {
                    self.inner = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.inner = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::{
        io::Cursor,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    };
    use tokio::io::ReadBuf;

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    fn split(data: &[u8], sizes: &[usize]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut offset = 0;
        for size in sizes.iter().cycle() {
            if offset >= data.len() {
                break;
            }
            let end = (offset + size).min(data.len());
            out.push(Bytes::copy_from_slice(&data[offset..end]));
            offset = end;
        }
        out
    }

    async fn drain(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn native_stream_is_passed_through_in_order() {
        let data = payload(10_000);
        let chunks = split(&data, &[1, 7, 4096, 0, 333]);
        let native: ByteStream =
            Box::pin(stream::iter(chunks.into_iter().map(Ok::<_, io::Error>)));
        assert_eq!(drain(adapt(BackendBody::Native(native))).await, data);
    }

    #[tokio::test]
    async fn channel_chunks_are_bridged() {
        let data = payload(50_000);
        let chunks = split(&data, &[1000, 17, 8192]);
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        assert_eq!(drain(adapt(BackendBody::Chunks(rx))).await, data);
    }

    #[tokio::test]
    async fn async_reader_is_bridged() {
        let data = payload(200_000);
        let reader = Cursor::new(data.clone());
        assert_eq!(drain(adapt(BackendBody::Reader(Box::new(reader)))).await, data);
    }

    #[tokio::test]
    async fn blocking_pipe_falls_back_to_one_buffered_chunk() {
        let data = payload(3_000);
        let stream = adapt(BackendBody::Pipe(Box::new(Cursor::new(data.clone()))));
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn empty_buffer_emits_nothing() {
        let chunks: Vec<_> = adapt(BackendBody::Buffered(Bytes::new())).collect().await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_an_error() {
        let native: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"late")),
        ]));
        let mut stream = adapt(BackendBody::Native(native));

        assert_eq!(stream.next().await.unwrap().unwrap(), "abc");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_adapted_stream_closes_channel() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = adapt(BackendBody::Chunks(rx));
        tx.send(Ok(Bytes::from_static(b"first"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");

        drop(stream);
        assert!(tx.is_closed());
    }

    struct TrackedReader {
        inner: Cursor<Vec<u8>>,
        dropped: Arc<AtomicBool>,
    }

    impl AsyncRead for TrackedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl Drop for TrackedReader {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn early_abort_releases_reader() {
        let dropped = Arc::new(AtomicBool::new(false));
        let reader = TrackedReader {
            inner: Cursor::new(payload(1_000_000)),
            dropped: dropped.clone(),
        };
        let mut stream = adapt(BackendBody::Reader(Box::new(reader)));
        assert!(stream.next().await.unwrap().is_ok());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reader_is_released_after_end() {
        let dropped = Arc::new(AtomicBool::new(false));
        let reader = TrackedReader {
            inner: Cursor::new(payload(10)),
            dropped: dropped.clone(),
        };
        let mut stream = adapt(BackendBody::Reader(Box::new(reader)));
        while stream.next().await.is_some() {}
        assert!(dropped.load(Ordering::SeqCst));
    }

    /// Yields `good` bytes, then fails every read after that.
    struct FailingReader {
        good: Cursor<Vec<u8>>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.good.position() < self.good.get_ref().len() as u64 {
                return Pin::new(&mut self.good).poll_read(cx, buf);
            }
            Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disk went away")))
        }
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.good.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disk went away")),
                n => Ok(n),
            }
        }
    }

    /// Collect items until the stream ends, asserting the error is last.
    async fn expect_single_error(mut stream: ByteStream, kind: io::ErrorKind) -> Vec<u8> {
        let mut data = Vec::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => data.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    assert_eq!(err.kind(), kind);
                    break;
                }
                None => panic!("stream ended without reporting the error"),
            }
        }
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        data
    }

    #[tokio::test]
    async fn reader_error_mid_read_is_terminal() {
        let reader = FailingReader {
            good: Cursor::new(payload(1_000)),
        };
        let stream = adapt(BackendBody::Reader(Box::new(reader)));
        let data = expect_single_error(stream, io::ErrorKind::UnexpectedEof).await;
        assert_eq!(data, payload(1_000));
    }

    #[tokio::test]
    async fn channel_error_is_terminal() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "producer failed")))
            .await
            .unwrap();
        tx.send(Ok(Bytes::from_static(b"late"))).await.unwrap();

        let stream = adapt(BackendBody::Chunks(rx));
        let data = expect_single_error(stream, io::ErrorKind::ConnectionAborted).await;
        assert_eq!(data, b"abc");
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn pipe_read_failure_is_terminal() {
        let reader = FailingReader {
            good: Cursor::new(payload(64)),
        };
        let stream = adapt(BackendBody::Pipe(Box::new(reader)));
        let data = expect_single_error(stream, io::ErrorKind::UnexpectedEof).await;
        assert!(data.is_empty());
    }
}
