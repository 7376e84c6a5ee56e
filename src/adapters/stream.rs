use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Chunked byte stream feeding an upload.
///
/// Backed by a bounded channel so a producer (e.g. a blocking ssh reader) can
/// never run ahead of the consumer by more than `capacity` chunks.
#[derive(Debug)]
pub struct ByteStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

#[derive(Debug, Clone)]
pub struct ByteSender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ByteStream {
    pub fn channel(capacity: usize) -> (ByteSender, ByteStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ByteSender { tx }, ByteStream { rx })
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> ByteStream {
        let (tx, rx) = mpsc::channel(1);
        // capacity 1 always fits the single chunk
        let _ = tx.try_send(Ok(data.into()));
        ByteStream { rx }
    }

    /// Drains the stream into memory. Only for small objects.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl ByteSender {
    /// Sends from a blocking thread. Returns false once the reader has gone away.
    pub fn blocking_send(&self, chunk: io::Result<Bytes>) -> bool {
        self.tx.blocking_send(chunk).is_ok()
    }

    pub async fn send(&self, chunk: io::Result<Bytes>) -> bool {
        self.tx.send(chunk).await.is_ok()
    }
}

impl Stream for ByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
