use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use depot_registry::{Package, RegistryError, RemoteMetadata, SearchOptions, Uplink};
use depot_storage::{LocalStorage, MemoryStorage, StorageError, TarballWriter};
use depot_utils::stream::{RecordStream, TarballReader};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Barrier;
use url::Url;

type MetadataReply = Box<dyn Fn(&str) -> depot_registry::Result<RemoteMetadata> + Send + Sync>;

/// Tracks how many uplink search streams are open at once.
#[derive(Default)]
pub struct SearchGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[allow(dead_code)]
impl SearchGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        GaugeGuard(self.clone())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Arc<SearchGauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockTarball {
    chunks: Vec<Bytes>,
    broken: bool,
}

/// Scripted uplink that counts the calls it receives.
pub struct MockUplink {
    name: String,
    url: Url,
    max_age: Duration,
    cache: bool,
    autogenerated: bool,
    reply: MetadataReply,
    tarballs: HashMap<String, MockTarball>,
    search_records: Option<Vec<Value>>,
    search_breaks: bool,
    search_gauge: Option<Arc<SearchGauge>>,
    barrier: Option<Arc<Barrier>>,
    metadata_calls: AtomicUsize,
    tarball_calls: AtomicUsize,
    search_calls: AtomicUsize,
    etags_sent: Mutex<Vec<Option<String>>>,
}

#[allow(dead_code)]
impl MockUplink {
    pub fn new(name: &str) -> Self {
        let url = format!("https://{name}.example/");
        Self::with_url(name, &url)
    }

    pub fn with_url(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: Url::parse(url).unwrap(),
            max_age: Duration::from_secs(120),
            cache: true,
            autogenerated: false,
            reply: Box::new(|name| {
                Err(RegistryError::Status {
                    status: 404,
                    url: format!("mock/{name}"),
                })
            }),
            tarballs: HashMap::new(),
            search_records: Some(Vec::new()),
            search_breaks: false,
            search_gauge: None,
            barrier: None,
            metadata_calls: AtomicUsize::new(0),
            tarball_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            etags_sent: Mutex::new(Vec::new()),
        }
    }

    pub fn autogenerated(mut self) -> Self {
        self.autogenerated = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.reply = Box::new(move |_| {
            Ok(RemoteMetadata {
                document: document.clone(),
                etag: Some("\"mock-etag\"".into()),
            })
        });
        self
    }

    pub fn not_modified(mut self) -> Self {
        self.reply = Box::new(|_| Err(RegistryError::NotModified));
        self
    }

    pub fn failing_with_code(mut self, code: &'static str) -> Self {
        self.reply = Box::new(move |_| {
            Err(RegistryError::Transport {
                code: Some(code.to_string()),
                message: format!("mock transport failure {code}"),
            })
        });
        self
    }

    pub fn failing_with_status(mut self, status: u16) -> Self {
        self.reply = Box::new(move |name| {
            Err(RegistryError::Status {
                status,
                url: format!("mock/{name}"),
            })
        });
        self
    }

    pub fn with_tarball(mut self, url: &str, chunks: &[&'static [u8]]) -> Self {
        self.tarballs.insert(
            url.to_string(),
            MockTarball {
                chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
                broken: false,
            },
        );
        self
    }

    /// A tarball whose stream fails after delivering `chunks`.
    pub fn with_broken_tarball(mut self, url: &str, chunks: &[&'static [u8]]) -> Self {
        self.tarballs.insert(
            url.to_string(),
            MockTarball {
                chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
                broken: true,
            },
        );
        self
    }

    pub fn with_search(mut self, records: Vec<Value>) -> Self {
        self.search_records = Some(records);
        self
    }

    /// A search stream that fails after yielding `records`.
    pub fn with_broken_search(mut self, records: Vec<Value>) -> Self {
        self.search_records = Some(records);
        self.search_breaks = true;
        self
    }

    pub fn with_search_gauge(mut self, gauge: Arc<SearchGauge>) -> Self {
        self.search_gauge = Some(gauge);
        self
    }

    /// Metadata replies wait until every party of `barrier` has arrived.
    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn with_failing_search(mut self) -> Self {
        self.search_records = None;
        self
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn tarball_calls(&self) -> usize {
        self.tarball_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn etags_sent(&self) -> Vec<Option<String>> {
        self.etags_sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uplink for MockUplink {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn max_age(&self) -> Duration {
        self.max_age
    }

    fn cache_enabled(&self) -> bool {
        self.cache
    }

    fn is_autogenerated(&self) -> bool {
        self.autogenerated
    }

    async fn get_remote_metadata(
        &self,
        name: &str,
        etag: Option<&str>,
    ) -> depot_registry::Result<RemoteMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.etags_sent.lock().unwrap().push(etag.map(String::from));
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        (self.reply)(name)
    }

    async fn fetch_tarball(&self, url: &str) -> depot_registry::Result<TarballReader<RegistryError>> {
        self.tarball_calls.fetch_add(1, Ordering::SeqCst);

        let Some(tarball) = self.tarballs.get(url) else {
            return Err(RegistryError::Status {
                status: 404,
                url: url.to_string(),
            });
        };

        let mut items: Vec<depot_registry::Result<Bytes>> =
            tarball.chunks.iter().cloned().map(Ok).collect();
        let content_length = if tarball.broken {
            items.push(Err(RegistryError::Transport {
                code: Some("ECONNRESET".into()),
                message: "connection reset by peer".into(),
            }));
            None
        } else {
            Some(tarball.chunks.iter().map(|c| c.len() as u64).sum())
        };

        Ok(TarballReader::new(
            content_length,
            futures::stream::iter(items).boxed(),
        ))
    }

    async fn search(
        &self,
        _start_key: u64,
        options: &SearchOptions,
    ) -> depot_registry::Result<RecordStream<RegistryError>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        let Some(records) = &self.search_records else {
            return Err(RegistryError::Transport {
                code: Some("ETIMEDOUT".into()),
                message: "search timed out".into(),
            });
        };

        let mut records: Vec<_> = records
            .iter()
            .filter(|record| options.matches(record))
            .cloned()
            .map(Ok)
            .collect();
        if self.search_breaks {
            records.push(Err(RegistryError::Transport {
                code: Some("ECONNRESET".into()),
                message: "connection reset by peer".into(),
            }));
        }

        let guard = self.search_gauge.as_ref().map(SearchGauge::enter);
        Ok(futures::stream::iter(records)
            .map(move |item| {
                let _open = &guard;
                item
            })
            .boxed())
    }
}

/// Memory storage that counts write-backs and can be told to misbehave.
#[derive(Default)]
pub struct InstrumentedStorage {
    inner: MemoryStorage,
    update_calls: AtomicUsize,
    fail_mirror: AtomicBool,
    corrupt_metadata: AtomicBool,
}

#[allow(dead_code)]
impl InstrumentedStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Tarball writers fail on the first write.
    pub fn fail_mirror(&self) {
        self.fail_mirror.store(true, Ordering::SeqCst);
    }

    /// Metadata reads fail with a server-class error.
    pub fn corrupt_metadata(&self) {
        self.corrupt_metadata.store(true, Ordering::SeqCst);
    }

    /// Seeds a package without going through the publish path.
    pub async fn seed(&self, package: Package) {
        let name = package.name.clone();
        self.inner.update_versions(&name, package).await.unwrap();
    }

    pub async fn seed_tarball(&self, name: &str, filename: &str, data: &'static [u8]) {
        let mut writer = self.inner.add_tarball(name, filename).await.unwrap();
        writer.write(Bytes::from_static(data)).await.unwrap();
        writer.done().await.unwrap();
    }
}

struct FailingWriter;

#[async_trait]
impl TarballWriter for FailingWriter {
    async fn write(&mut self, _chunk: Bytes) -> depot_storage::Result<()> {
        Err(StorageError::IoError {
            action: "writing mock tarball".into(),
            source: std::io::Error::other("disk full"),
        })
    }

    fn set_content_length(&mut self, _length: u64) {}

    async fn done(self: Box<Self>) -> depot_storage::Result<u64> {
        Ok(0)
    }

    async fn abort(self: Box<Self>) -> depot_storage::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for InstrumentedStorage {
    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    async fn get_package_metadata(&self, name: &str) -> depot_storage::Result<Package> {
        if self.corrupt_metadata.load(Ordering::SeqCst) {
            return Err(StorageError::BadData(format!("{name}: mock corruption")));
        }
        self.inner.get_package_metadata(name).await
    }

    async fn add_package(&self, name: &str, package: Package) -> depot_storage::Result<Package> {
        self.inner.add_package(name, package).await
    }

    async fn update_versions(&self, name: &str, incoming: Package) -> depot_storage::Result<Package> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.update_versions(name, incoming).await
    }

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: Option<&str>,
    ) -> depot_storage::Result<()> {
        self.inner.add_version(name, version, metadata, tag).await
    }

    async fn merge_tags(
        &self,
        name: &str,
        tags: &BTreeMap<String, Option<String>>,
    ) -> depot_storage::Result<()> {
        self.inner.merge_tags(name, tags).await
    }

    async fn change_package(
        &self,
        name: &str,
        incoming: Package,
        revision: Option<&str>,
    ) -> depot_storage::Result<()> {
        self.inner.change_package(name, incoming, revision).await
    }

    async fn remove_package(&self, name: &str) -> depot_storage::Result<()> {
        self.inner.remove_package(name).await
    }

    async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        revision: Option<&str>,
    ) -> depot_storage::Result<()> {
        self.inner.remove_tarball(name, filename, revision).await
    }

    async fn add_tarball(
        &self,
        name: &str,
        filename: &str,
    ) -> depot_storage::Result<Box<dyn TarballWriter>> {
        if self.fail_mirror.load(Ordering::SeqCst) {
            return Ok(Box::new(FailingWriter));
        }
        self.inner.add_tarball(name, filename).await
    }

    async fn get_tarball(
        &self,
        name: &str,
        filename: &str,
    ) -> depot_storage::Result<TarballReader<StorageError>> {
        self.inner.get_tarball(name, filename).await
    }

    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> depot_storage::Result<RecordStream<StorageError>> {
        self.inner.search(start_key, options).await
    }

    async fn list_names(&self) -> depot_storage::Result<Vec<String>> {
        self.inner.list_names().await
    }
}
