//! Search across every uplink and local storage as one stream.

use std::{
    fmt::Display,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use depot_registry::{SearchOptions, Uplink, UplinkRegistry};
use depot_storage::LocalStorage;
use depot_utils::stream::RecordStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

const CHANNEL_DEPTH: usize = 64;

/// Search records from all sources: uplinks first in configuration order,
/// local packages last.
pub struct SearchStream {
    rx: mpsc::Receiver<Value>,
    task: JoinHandle<()>,
    aborted: bool,
}

impl SearchStream {
    /// Cancels the segment being read and skips the remaining sources.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.rx.close();
        self.task.abort();
    }
}

impl Stream for SearchStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.aborted {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

pub struct SearchFanIn {
    uplinks: Arc<UplinkRegistry>,
    storage: Arc<dyn LocalStorage>,
}

impl SearchFanIn {
    pub fn new(uplinks: Arc<UplinkRegistry>, storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            uplinks,
            storage,
        }
    }

    /// Streams records changed after `start_key` (epoch millis).
    ///
    /// Sources are read one after the other. A source that fails to open or
    /// breaks mid-stream is logged and skipped.
    pub fn search(&self, start_key: u64, options: SearchOptions) -> SearchStream {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let uplinks: Vec<Arc<dyn Uplink>> = if options.local_only {
            Vec::new()
        } else {
            self.uplinks.iter().cloned().collect()
        };
        let storage = self.storage.clone();

        let task = tokio::spawn(async move {
            for uplink in uplinks {
                let opened = tokio::select! {
                    _ = tx.closed() => return,
                    opened = uplink.search(start_key, &options) => opened,
                };
                match opened {
                    Ok(records) => {
                        if !forward(&tx, records, uplink.name()).await {
                            return;
                        }
                    }
                    Err(err) => warn!(uplink = uplink.name(), error = %err, "uplink search failed"),
                }
            }

            match storage.search(start_key, &options).await {
                Ok(records) => {
                    forward(&tx, records, "local").await;
                }
                Err(err) => warn!(error = %err, "local search failed"),
            }
        });

        SearchStream {
            rx,
            task,
            aborted: false,
        }
    }
}

/// Copies one source into `tx`. Returns `false` when the consumer is gone.
async fn forward<E: Display>(tx: &mpsc::Sender<Value>, mut records: RecordStream<E>, source: &str) -> bool {
    let mut count = 0usize;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return false,
            next = records.next() => next,
        };

        match next {
            Some(Ok(record)) => {
                if tx.send(record).await.is_err() {
                    return false;
                }
                count += 1;
            }
            Some(Err(err)) => {
                warn!(source, error = %err, "search stream broke off");
                return true;
            }
            None => {
                debug!(source, count, "search source finished");
                return true;
            }
        }
    }
}
