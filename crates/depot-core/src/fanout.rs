//! Piping a remote tarball to the caller while mirroring it locally.

use bytes::Bytes;
use depot_storage::TarballWriter;
use depot_utils::stream::ByteStream;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::error::{DepotError, Result};

/// Spawns the task forwarding `source` into `caller`, copying every chunk
/// into `mirror` when present.
///
/// The caller side is mandatory: when it goes away the mirror is aborted and
/// `source` dropped. The mirror is best effort: a failed write or finish
/// aborts only the mirror. A `source` error aborts the mirror and is passed
/// on to the caller. The mirror is finished before the caller sees the end
/// of the stream.
pub(crate) fn spawn_fanout(
    label: String,
    mut source: ByteStream<DepotError>,
    caller: mpsc::Sender<Result<Bytes>>,
    mut mirror: Option<Box<dyn TarballWriter>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = caller.closed() => {
                    debug!(tarball = %label, "caller went away");
                    abort_mirror(&label, mirror.take()).await;
                    return;
                }
                next = source.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let Some(writer) = mirror.as_mut() {
                        if let Err(err) = writer.write(chunk.clone()).await {
                            warn!(tarball = %label, error = %err, "local copy failed, continuing without it");
                            abort_mirror(&label, mirror.take()).await;
                        }
                    }

                    if caller.send(Ok(chunk)).await.is_err() {
                        debug!(tarball = %label, "caller went away");
                        abort_mirror(&label, mirror.take()).await;
                        return;
                    }
                }
                Some(Err(err)) => {
                    warn!(tarball = %label, error = %err, "remote tarball stream failed");
                    abort_mirror(&label, mirror.take()).await;
                    let _ = caller.send(Err(err)).await;
                    return;
                }
                None => {
                    if let Some(writer) = mirror.take() {
                        match writer.done().await {
                            Ok(size) => debug!(tarball = %label, size, "tarball stored locally"),
                            Err(err) => warn!(tarball = %label, error = %err, "failed to store tarball locally"),
                        }
                    }
                    return;
                }
            }
        }
    })
}

async fn abort_mirror(label: &str, mirror: Option<Box<dyn TarballWriter>>) {
    if let Some(writer) = mirror {
        if let Err(err) = writer.abort().await {
            warn!(tarball = %label, error = %err, "failed to discard partial local copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use depot_storage::StorageError;
    use depot_utils::stream::receiver_stream;

    use super::*;

    #[derive(Default)]
    struct Journal {
        written: Vec<u8>,
        done: bool,
        aborted: bool,
    }

    struct RecordingWriter {
        journal: Arc<Mutex<Journal>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl TarballWriter for RecordingWriter {
        async fn write(&mut self, chunk: Bytes) -> depot_storage::Result<()> {
            if self.fail_writes {
                return Err(StorageError::BadData("disk full".into()));
            }
            self.journal.lock().unwrap().written.extend_from_slice(&chunk);
            Ok(())
        }

        fn set_content_length(&mut self, _length: u64) {}

        async fn done(self: Box<Self>) -> depot_storage::Result<u64> {
            let mut journal = self.journal.lock().unwrap();
            journal.done = true;
            Ok(journal.written.len() as u64)
        }

        async fn abort(self: Box<Self>) -> depot_storage::Result<()> {
            self.journal.lock().unwrap().aborted = true;
            Ok(())
        }
    }

    fn source(items: Vec<Result<Bytes>>) -> ByteStream<DepotError> {
        futures::stream::iter(items).boxed()
    }

    fn mirror(fail_writes: bool) -> (Arc<Mutex<Journal>>, Box<dyn TarballWriter>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let writer = RecordingWriter {
            journal: journal.clone(),
            fail_writes,
        };
        (journal, Box::new(writer))
    }

    async fn drain(rx: mpsc::Receiver<Result<Bytes>>) -> (Vec<u8>, Option<DepotError>) {
        let mut stream = receiver_stream(rx);
        let mut bytes = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => return (bytes, Some(err)),
            }
        }
        (bytes, None)
    }

    #[tokio::test]
    async fn test_mirror_receives_every_chunk() {
        let (journal, writer) = mirror(false);
        let (tx, rx) = mpsc::channel(4);
        let items = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];

        spawn_fanout("pkg/pkg.tgz".into(), source(items), tx, Some(writer));
        let (bytes, err) = drain(rx).await;

        assert_eq!(bytes, b"abcd");
        assert!(err.is_none());
        let journal = journal.lock().unwrap();
        assert_eq!(journal.written, b"abcd");
        assert!(journal.done);
        assert!(!journal.aborted);
    }

    #[tokio::test]
    async fn test_failing_mirror_does_not_affect_caller() {
        let (journal, writer) = mirror(true);
        let (tx, rx) = mpsc::channel(4);
        let items = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];

        spawn_fanout("pkg/pkg.tgz".into(), source(items), tx, Some(writer));
        let (bytes, err) = drain(rx).await;

        assert_eq!(bytes, b"abcd");
        assert!(err.is_none());
        let journal = journal.lock().unwrap();
        assert!(journal.aborted);
        assert!(!journal.done);
    }

    #[tokio::test]
    async fn test_source_error_aborts_mirror_and_reaches_caller() {
        let (journal, writer) = mirror(false);
        let (tx, rx) = mpsc::channel(4);
        let items = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(DepotError::Internal("connection reset".into())),
        ];

        spawn_fanout("pkg/pkg.tgz".into(), source(items), tx, Some(writer));
        let (bytes, err) = drain(rx).await;

        assert_eq!(bytes, b"ab");
        assert!(matches!(err, Some(DepotError::Internal(_))));
        assert!(journal.lock().unwrap().aborted);
    }

    #[tokio::test]
    async fn test_dropped_caller_aborts_mirror() {
        let (journal, writer) = mirror(false);
        let (tx, rx) = mpsc::channel(1);
        let endless = futures::stream::repeat_with(|| Ok(Bytes::from_static(b"x"))).boxed();

        drop(rx);
        spawn_fanout("pkg/pkg.tgz".into(), endless, tx, Some(writer))
            .await
            .unwrap();

        let journal = journal.lock().unwrap();
        assert!(journal.aborted);
        assert!(!journal.done);
    }
}
