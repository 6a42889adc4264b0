//! Serving tarballs from local storage, falling back to uplinks.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use depot_registry::{DistFile, UplinkRegistry};
use depot_storage::LocalStorage;
use depot_utils::stream::ByteStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::{DepotError, Result},
    fanout::spawn_fanout,
    sync::{SyncOptions, UplinkSyncEngine},
};

const CHANNEL_DEPTH: usize = 16;

enum Source {
    Direct(ByteStream<DepotError>),
    Channel(mpsc::Receiver<Result<Bytes>>),
    Aborted,
}

/// An open tarball. Yields the bytes in order, then ends.
pub struct TarballStream {
    content_length: Option<u64>,
    source: Source,
}

impl TarballStream {
    fn direct(content_length: Option<u64>, stream: ByteStream<DepotError>) -> Self {
        Self {
            content_length,
            source: Source::Direct(stream),
        }
    }

    fn channel(content_length: Option<u64>, rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self {
            content_length,
            source: Source::Channel(rx),
        }
    }

    /// Size announced by the source when it was opened.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Stops reading. A remote transfer is cancelled and its partial local
    /// copy discarded.
    pub fn abort(&mut self) {
        if let Source::Channel(rx) = &mut self.source {
            rx.close();
        }
        self.source = Source::Aborted;
    }
}

impl Stream for TarballStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().source {
            Source::Direct(stream) => stream.poll_next_unpin(cx),
            Source::Channel(rx) => rx.poll_recv(cx),
            Source::Aborted => Poll::Ready(None),
        }
    }
}

/// Resolves tarball requests: local storage first, then the uplink the
/// package metadata points at, mirroring the download locally.
pub struct TarballProxyCache {
    uplinks: Arc<UplinkRegistry>,
    storage: Arc<dyn LocalStorage>,
    sync: Arc<UplinkSyncEngine>,
}

impl TarballProxyCache {
    pub fn new(
        uplinks: Arc<UplinkRegistry>,
        storage: Arc<dyn LocalStorage>,
        sync: Arc<UplinkSyncEngine>,
    ) -> Self {
        Self {
            uplinks,
            storage,
            sync,
        }
    }

    /// Opens `filename` of package `name`.
    ///
    /// Resolves once the bytes can start flowing. When the tarball is not
    /// stored locally and no uplink knows it either, the local not-found
    /// error is returned.
    pub async fn fetch(&self, name: &str, filename: &str) -> Result<TarballStream> {
        let not_found = match self.storage.get_tarball(name, filename).await {
            Ok(reader) => {
                debug!(package = name, filename, "serving tarball from local storage");
                let reader = reader.map_err::<DepotError>();
                return Ok(TarballStream::direct(reader.content_length, reader.stream));
            }
            Err(err) if err.is_not_found() => err,
            Err(err) => return Err(err.into()),
        };

        let local = match self.storage.get_package_metadata(name).await {
            Ok(package) => Some(package),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let known = local
            .as_ref()
            .and_then(|package| package.distfiles.get(filename).cloned());

        let file = match known {
            Some(file) => file,
            None => {
                let outcome = self
                    .sync
                    .sync(name, local, &SyncOptions::default())
                    .await?;
                match outcome.package.distfiles.get(filename) {
                    Some(file) => file.clone(),
                    None => return Err(not_found.into()),
                }
            }
        };

        self.fetch_remote(name, filename, &file).await
    }

    async fn fetch_remote(&self, name: &str, filename: &str, file: &DistFile) -> Result<TarballStream> {
        let uplink = match self.uplinks.find_for_url(&file.url) {
            Some(uplink) => uplink,
            None => self.uplinks.ad_hoc(&file.url)?,
        };

        debug!(
            package = name,
            filename,
            uplink = uplink.name(),
            ad_hoc = uplink.is_autogenerated(),
            "fetching tarball from uplink"
        );

        let (mirror, remote) = if uplink.cache_enabled() {
            let (mirror, remote) = tokio::join!(
                self.storage.add_tarball(name, filename),
                uplink.fetch_tarball(&file.url)
            );
            let mirror = match mirror {
                Ok(writer) => Some(writer),
                Err(err) => {
                    warn!(package = name, filename, error = %err, "cannot store tarball locally");
                    None
                }
            };
            (mirror, remote)
        } else {
            (None, uplink.fetch_tarball(&file.url).await)
        };

        let remote = match remote {
            Ok(remote) => remote,
            Err(err) => {
                if let Some(writer) = mirror {
                    if let Err(abort_err) = writer.abort().await {
                        warn!(package = name, filename, error = %abort_err, "failed to discard local copy");
                    }
                }
                return Err(err.into());
            }
        };

        let content_length = remote.content_length;
        let mut mirror = mirror;
        if let (Some(writer), Some(length)) = (mirror.as_mut(), content_length) {
            writer.set_content_length(length);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        spawn_fanout(
            format!("{name}/{filename}"),
            remote.map_err::<DepotError>().stream,
            tx,
            mirror,
        );

        Ok(TarballStream::channel(content_length, rx))
    }
}
