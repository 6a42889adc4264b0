//! Stream types shared by storage backends and uplink clients.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

/// A boxed stream of byte chunks.
pub type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

/// A boxed stream of JSON records, used for search results.
pub type RecordStream<E> = Pin<Box<dyn Stream<Item = Result<Value, E>> + Send>>;

/// An opened tarball: its declared length (when known) and its bytes.
///
/// Obtaining a `TarballReader` means the source has been opened successfully;
/// open failures are reported before one exists.
pub struct TarballReader<E> {
    pub content_length: Option<u64>,
    pub stream: ByteStream<E>,
}

impl<E> TarballReader<E> {
    pub fn new(content_length: Option<u64>, stream: ByteStream<E>) -> Self {
        Self {
            content_length,
            stream,
        }
    }

    /// Converts the error type of the underlying stream.
    pub fn map_err<F>(self) -> TarballReader<F>
    where
        E: 'static,
        F: From<E> + 'static,
    {
        TarballReader {
            content_length: self.content_length,
            stream: self.stream.map(|item| item.map_err(F::from)).boxed(),
        }
    }
}

/// Adapts a bounded channel receiver into a boxed stream that ends when every
/// sender is dropped.
pub fn receiver_stream<T>(rx: mpsc::Receiver<T>) -> Pin<Box<dyn Stream<Item = T> + Send>>
where
    T: Send + 'static,
{
    futures::stream::unfold(rx, |mut rx| {
        async move { rx.recv().await.map(|item| (item, rx)) }
    })
    .boxed()
}
