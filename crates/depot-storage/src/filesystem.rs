//! Local filesystem storage backend.
//!
//! Layout: `<root>/<name>/package.json` with tarballs next to it (scoped
//! names nest as `<root>/@scope/name/`), and `<root>/.depot-db.json` listing
//! locally published packages.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::UNIX_EPOCH,
};

use async_trait::async_trait;
use bytes::Bytes;
use depot_registry::{Package, SearchOptions};
use depot_utils::stream::{RecordStream, TarballReader};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    error::{ErrorContext, Result, StorageError},
    record,
    traits::{LocalStorage, TarballWriter},
};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;
const PACKAGE_FILE: &str = "package.json";
const DB_FILE: &str = ".depot-db.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Default, Deserialize, Serialize)]
struct LocalDb {
    list: Vec<String>,
}

/// Local filesystem package store.
pub struct FilesystemStorage {
    root: PathBuf,
    // Serializes read-modify-write cycles on package documents, shared with
    // open tarball writers.
    lock: Arc<Mutex<()>>,
}

impl FilesystemStorage {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating storage directory {}", root.display()))?;
        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, name: &str) -> Result<PathBuf> {
        record::validate_package_name(name)?;
        Ok(self.root.join(name))
    }

    fn tarball_path(&self, name: &str, filename: &str) -> Result<PathBuf> {
        record::validate_filename(filename)?;
        Ok(self.package_dir(name)?.join(filename))
    }

    async fn read_package(&self, name: &str) -> Result<Package> {
        let path = self.package_dir(name)?.join(PACKAGE_FILE);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(err) => {
                return Err(StorageError::IoError {
                    action: format!("reading {}", path.display()),
                    source: err,
                });
            }
        };

        let mut pkg: Package = serde_json::from_slice(&content)
            .map_err(|err| StorageError::BadData(format!("{}: {err}", path.display())))?;
        if pkg.name.is_empty() {
            pkg.name = name.to_string();
        }
        Ok(pkg)
    }

    async fn write_package(&self, name: &str, pkg: &Package) -> Result<()> {
        let dir = self.package_dir(name)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;

        let content = serde_json::to_vec_pretty(pkg)?;
        write_atomic(&dir.join(PACKAGE_FILE), &content).await
    }

    /// Loads a package, applies `update`, bumps its revision and writes it
    /// back. Nothing is written when `update` fails.
    async fn update_package<F>(&self, name: &str, update: F) -> Result<Package>
    where
        F: FnOnce(&mut Package) -> Result<()> + Send,
    {
        let _guard = self.lock.lock().await;
        let mut pkg = self.read_package(name).await?;
        update(&mut pkg)?;
        record::bump_revision(&mut pkg);
        self.write_package(name, &pkg).await?;
        Ok(pkg)
    }

    async fn read_db(&self) -> Result<LocalDb> {
        let path = self.root.join(DB_FILE);
        match fs::read(&path).await {
            Ok(content) => {
                serde_json::from_slice(&content)
                    .map_err(|err| StorageError::BadData(format!("{}: {err}", path.display())))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LocalDb::default()),
            Err(err) => {
                Err(StorageError::IoError {
                    action: format!("reading {}", path.display()),
                    source: err,
                })
            }
        }
    }

    async fn write_db(&self, db: &LocalDb) -> Result<()> {
        let content = serde_json::to_vec_pretty(db)?;
        write_atomic(&self.root.join(DB_FILE), &content).await
    }

    /// Package names found on disk with the mtime of their document.
    async fn walk_packages(&self) -> Result<Vec<(String, i64)>> {
        let mut found = Vec::new();
        let mut entries = read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await.with_context(|| {
            format!("listing {}", self.root.display())
        })? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || !is_dir(&entry.path()).await {
                continue;
            }

            if file_name.starts_with('@') {
                let mut scoped = read_dir(&entry.path()).await?;
                while let Some(inner) = scoped.next_entry().await.with_context(|| {
                    format!("listing {}", entry.path().display())
                })? {
                    let name = format!("{file_name}/{}", inner.file_name().to_string_lossy());
                    if let Some(mtime) = package_mtime(&inner.path()).await {
                        found.push((name, mtime));
                    }
                }
            } else if let Some(mtime) = package_mtime(&entry.path()).await {
                found.push((file_name, mtime));
            }
        }

        found.sort();
        Ok(found)
    }
}

async fn read_dir(path: &Path) -> Result<fs::ReadDir> {
    fs::read_dir(path)
        .await
        .with_context(|| format!("listing {}", path.display()))
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

async fn package_mtime(dir: &Path) -> Option<i64> {
    let meta = fs::metadata(dir.join(PACKAGE_FILE)).await.ok()?;
    let modified = meta.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    i64::try_from(millis).ok()
}

fn temp_path(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}.{n}", std::process::id()))
}

/// Writes to a temp file, syncs it, then renames it over `path`.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp = temp_path(path);
    {
        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("creating {}", temp.display()))?;
        file.write_all(content)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp.display()))?;
    }
    fs::rename(&temp, path)
        .await
        .with_context(|| format!("renaming {} to {}", temp.display(), path.display()))
}

#[async_trait]
impl LocalStorage for FilesystemStorage {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn get_package_metadata(&self, name: &str) -> Result<Package> {
        self.read_package(name).await
    }

    async fn add_package(&self, name: &str, mut package: Package) -> Result<Package> {
        let _guard = self.lock.lock().await;

        match self.read_package(name).await {
            Ok(_) => return Err(StorageError::Conflict(format!("package `{name}` already exists"))),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        package.name = name.to_string();
        record::bump_revision(&mut package);
        self.write_package(name, &package).await?;

        let mut db = self.read_db().await?;
        if !db.list.iter().any(|n| n == name) {
            db.list.push(name.to_string());
            self.write_db(&db).await?;
        }

        debug!(name, "package added");
        Ok(package)
    }

    async fn update_versions(&self, name: &str, incoming: Package) -> Result<Package> {
        let _guard = self.lock.lock().await;

        let mut local = match self.read_package(name).await {
            Ok(pkg) => pkg,
            Err(err) if err.is_not_found() => Package::template(name),
            Err(err) => return Err(err),
        };

        if record::apply_update(&mut local, &incoming) {
            record::bump_revision(&mut local);
            self.write_package(name, &local).await?;
        }
        local.provenance = incoming.provenance;

        Ok(local)
    }

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: Option<&str>,
    ) -> Result<()> {
        self.update_package(name, |pkg| record::add_version(pkg, version, metadata, tag))
            .await
            .map(|_| ())
    }

    async fn merge_tags(&self, name: &str, tags: &BTreeMap<String, Option<String>>) -> Result<()> {
        self.update_package(name, |pkg| record::merge_tags(pkg, tags))
            .await
            .map(|_| ())
    }

    async fn change_package(
        &self,
        name: &str,
        incoming: Package,
        revision: Option<&str>,
    ) -> Result<()> {
        self.update_package(name, |pkg| {
            record::check_revision(pkg, revision)?;
            record::change_package(pkg, incoming);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn remove_package(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.package_dir(name)?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(err) => {
                return Err(StorageError::IoError {
                    action: format!("removing {}", dir.display()),
                    source: err,
                });
            }
        }

        let mut db = self.read_db().await?;
        let before = db.list.len();
        db.list.retain(|n| n != name);
        if db.list.len() != before {
            self.write_db(&db).await?;
        }

        debug!(name, "package removed");
        Ok(())
    }

    async fn remove_tarball(&self, name: &str, filename: &str, revision: Option<&str>) -> Result<()> {
        let path = self.tarball_path(name, filename)?;

        self.update_package(name, |pkg| {
            record::check_revision(pkg, revision)?;
            record::remove_attachment(pkg, filename)
        })
        .await?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(StorageError::IoError {
                    action: format!("removing {}", path.display()),
                    source: err,
                })
            }
        }
    }

    async fn add_tarball(&self, name: &str, filename: &str) -> Result<Box<dyn TarballWriter>> {
        let path = self.tarball_path(name, filename)?;

        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if exists {
            return Err(StorageError::Conflict(format!("{name}/{filename}")));
        }

        let dir = self.package_dir(name)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;

        let temp = temp_path(&path);
        let file = fs::File::create(&temp)
            .await
            .with_context(|| format!("creating {}", temp.display()))?;

        Ok(Box::new(FilesystemTarballWriter {
            storage_root: self.root.clone(),
            lock: self.lock.clone(),
            name: name.to_string(),
            filename: filename.to_string(),
            file,
            temp_path: temp,
            final_path: path,
            bytes_written: 0,
            expected_length: None,
        }))
    }

    async fn get_tarball(&self, name: &str, filename: &str) -> Result<TarballReader<StorageError>> {
        let path = self.tarball_path(name, filename)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("{name}/{filename}")));
            }
            Err(err) => {
                return Err(StorageError::IoError {
                    action: format!("opening {}", path.display()),
                    source: err,
                });
            }
        };

        let content_length = file.metadata().await.ok().map(|m| m.len());

        let stream = futures::stream::unfold(Some(file), move |state| {
            let path = path.clone();
            async move {
                let mut file = state?;
                let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        Some((Ok(Bytes::from(buf)), Some(file)))
                    }
                    Err(err) => {
                        Some((
                            Err(StorageError::IoError {
                                action: format!("reading {}", path.display()),
                                source: err,
                            }),
                            None,
                        ))
                    }
                }
            }
        });

        Ok(TarballReader::new(content_length, stream.boxed()))
    }

    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> Result<RecordStream<StorageError>> {
        let mut records = Vec::new();

        for (name, mtime) in self.walk_packages().await? {
            if mtime <= start_key as i64 {
                continue;
            }
            match self.read_package(&name).await {
                Ok(pkg) => {
                    if let Some(record) = record::search_record(&pkg, mtime) {
                        if options.matches(&record) {
                            records.push(Ok(record));
                        }
                    }
                }
                Err(err) => {
                    warn!(name = %name, error = %err, "skipping unreadable package in search");
                }
            }
        }

        Ok(futures::stream::iter(records).boxed())
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.read_db().await?.list)
    }
}

struct FilesystemTarballWriter {
    storage_root: PathBuf,
    lock: Arc<Mutex<()>>,
    name: String,
    filename: String,
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    expected_length: Option<u64>,
}

impl FilesystemTarballWriter {
    async fn record_attachment(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.storage_root.join(&self.name).join(PACKAGE_FILE);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(StorageError::IoError {
                    action: format!("reading {}", path.display()),
                    source: err,
                })
            }
        };

        let mut pkg: Package = serde_json::from_slice(&content)
            .map_err(|err| StorageError::BadData(format!("{}: {err}", path.display())))?;
        record::record_attachment(&mut pkg, &self.filename, self.bytes_written);
        write_atomic(&path, &serde_json::to_vec_pretty(&pkg)?).await
    }
}

#[async_trait]
impl TarballWriter for FilesystemTarballWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", self.temp_path.display()))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    fn set_content_length(&mut self, length: u64) {
        self.expected_length = Some(length);
    }

    async fn done(self: Box<Self>) -> Result<u64> {
        if let Some(expected) = self.expected_length {
            if expected != self.bytes_written {
                let written = self.bytes_written;
                let name = format!("{}/{}", self.name, self.filename);
                self.abort().await?;
                return Err(StorageError::BadData(format!(
                    "{name}: expected {expected} bytes, received {written}"
                )));
            }
        }

        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing {}", self.temp_path.display()))?;
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .with_context(|| {
                format!(
                    "renaming {} to {}",
                    self.temp_path.display(),
                    self.final_path.display()
                )
            })?;

        // The tarball is already committed; attachment bookkeeping is best effort.
        if let Err(err) = self.record_attachment().await {
            warn!(
                package = %self.name,
                filename = %self.filename,
                error = %err,
                "failed to record attachment"
            );
        }
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let Self {
            file,
            temp_path,
            ..
        } = *self;
        drop(file);

        match fs::remove_file(&temp_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(StorageError::IoError {
                    action: format!("removing {}", temp_path.display()),
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;

    async fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    fn published(name: &str) -> Package {
        let mut pkg = Package::template(name);
        pkg.versions.insert(
            "1.0.0".into(),
            json!({"name": name, "version": "1.0.0", "description": "first"}),
        );
        pkg.dist_tags.insert("latest".into(), "1.0.0".into());
        pkg
    }

    async fn write_tarball(storage: &FilesystemStorage, name: &str, file: &str, data: &[u8]) {
        let mut writer = storage.add_tarball(name, file).await.unwrap();
        writer.set_content_length(data.len() as u64);
        writer.write(Bytes::copy_from_slice(data)).await.unwrap();
        writer.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_get_package() {
        let (_dir, storage) = storage().await;

        let stored = storage.add_package("@scope/pkg", published("@scope/pkg")).await.unwrap();
        assert!(stored.rev.starts_with("1-"));

        let read = storage.get_package_metadata("@scope/pkg").await.unwrap();
        assert_eq!(read.latest(), Some("1.0.0"));
        assert_eq!(storage.list_names().await.unwrap(), vec!["@scope/pkg"]);

        let err = storage.add_package("@scope/pkg", published("@scope/pkg")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_package_is_not_found() {
        let (_dir, storage) = storage().await;
        let err = storage.get_package_metadata("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_corrupt_package_is_bad_data() {
        let (dir, storage) = storage().await;
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(PACKAGE_FILE), b"{not json").unwrap();

        let err = storage.get_package_metadata("broken").await.unwrap_err();
        assert!(matches!(err, StorageError::BadData(_)));
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn test_update_versions_creates_and_skips_unchanged() {
        let (_dir, storage) = storage().await;

        let stored = storage.update_versions("proxied", published("proxied")).await.unwrap();
        let rev = stored.rev.clone();
        assert!(!rev.is_empty());
        assert!(storage.list_names().await.unwrap().is_empty());

        let again = storage.update_versions("proxied", published("proxied")).await.unwrap();
        assert_eq!(again.rev, rev);
    }

    #[tokio::test]
    async fn test_tarball_roundtrip_and_conflict() {
        let (_dir, storage) = storage().await;
        storage.add_package("pkg", published("pkg")).await.unwrap();

        write_tarball(&storage, "pkg", "pkg-1.0.0.tgz", b"tarball-bytes").await;

        let reader = storage.get_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        assert_eq!(reader.content_length, Some(13));
        let chunks: Vec<Bytes> = reader.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"tarball-bytes");

        let pkg = storage.get_package_metadata("pkg").await.unwrap();
        assert_eq!(pkg.attachments["pkg-1.0.0.tgz"]["size"], json!(13));

        let err = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.err().unwrap();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_tarball_length_mismatch_discards() {
        let (_dir, storage) = storage().await;

        let mut writer = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        writer.set_content_length(100);
        writer.write(Bytes::from_static(b"short")).await.unwrap();
        let err = writer.done().await.unwrap_err();
        assert!(matches!(err, StorageError::BadData(_)));

        let err = storage.get_tarball("pkg", "pkg-1.0.0.tgz").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_add_tarball_reports_unreadable_path() {
        let (dir, storage) = storage().await;
        // A plain file where the package directory should be.
        std::fs::write(dir.path().join("pkg"), b"").unwrap();

        let err = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.err().unwrap();

        assert!(
            matches!(&err, StorageError::IoError { action, .. } if action.starts_with("checking")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_finishing_tarball_keeps_concurrent_update() {
        let (_dir, storage) = storage().await;
        storage.add_package("pkg", published("pkg")).await.unwrap();

        let mut synced = storage.get_package_metadata("pkg").await.unwrap();
        synced
            .versions
            .insert("2.0.0".into(), json!({"name": "pkg", "version": "2.0.0"}));

        let mut writer = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        writer.write(Bytes::from_static(b"data")).await.unwrap();

        // Hold the document lock the way a sync write-back does.
        let guard = storage.lock.lock().await;
        let finishing = tokio::spawn(writer.done());
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.write_package("pkg", &synced).await.unwrap();
        drop(guard);

        assert_eq!(finishing.await.unwrap().unwrap(), 4);
        let pkg = storage.get_package_metadata("pkg").await.unwrap();
        assert!(pkg.versions.contains_key("2.0.0"));
        assert_eq!(pkg.attachments["pkg-1.0.0.tgz"]["size"], json!(4));
    }

    #[tokio::test]
    async fn test_committed_tarball_survives_unreadable_document() {
        let (dir, storage) = storage().await;
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg").join(PACKAGE_FILE), b"{not json").unwrap();

        let mut writer = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        writer.write(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(writer.done().await.unwrap(), 4);

        let reader = storage.get_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        assert_eq!(reader.content_length, Some(4));
    }

    #[tokio::test]
    async fn test_aborted_tarball_is_invisible() {
        let (_dir, storage) = storage().await;

        let mut writer = storage.add_tarball("pkg", "pkg-1.0.0.tgz").await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await.unwrap();

        let err = storage.get_tarball("pkg", "pkg-1.0.0.tgz").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_tarball() {
        let (_dir, storage) = storage().await;
        storage.add_package("pkg", published("pkg")).await.unwrap();
        write_tarball(&storage, "pkg", "pkg-1.0.0.tgz", b"data").await;

        storage.remove_tarball("pkg", "pkg-1.0.0.tgz", None).await.unwrap();
        assert!(storage
            .get_tarball("pkg", "pkg-1.0.0.tgz")
            .await
            .err()
            .unwrap()
            .is_not_found());

        let err = storage.remove_tarball("pkg", "pkg-1.0.0.tgz", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_package() {
        let (_dir, storage) = storage().await;
        storage.add_package("pkg", published("pkg")).await.unwrap();

        storage.remove_package("pkg").await.unwrap();
        assert!(storage.list_names().await.unwrap().is_empty());
        assert!(storage.remove_package("pkg").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_add_version_and_tags() {
        let (_dir, storage) = storage().await;
        storage.add_package("pkg", published("pkg")).await.unwrap();

        storage
            .add_version("pkg", "1.1.0", json!({"name": "pkg", "version": "1.1.0"}), Some("next"))
            .await
            .unwrap();
        storage
            .merge_tags(
                "pkg",
                &BTreeMap::from([("latest".to_string(), Some("1.1.0".to_string()))]),
            )
            .await
            .unwrap();

        let pkg = storage.get_package_metadata("pkg").await.unwrap();
        assert_eq!(pkg.latest(), Some("1.1.0"));
        assert_eq!(pkg.dist_tags["next"], "1.1.0");
        assert!(pkg.rev.starts_with("3-"));
    }

    #[tokio::test]
    async fn test_change_package_checks_revision() {
        let (_dir, storage) = storage().await;
        let stored = storage.add_package("pkg", published("pkg")).await.unwrap();

        let err = storage
            .change_package("pkg", Package::template("pkg"), Some("0-stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        storage
            .change_package("pkg", Package::template("pkg"), Some(&stored.rev))
            .await
            .unwrap();
        let pkg = storage.get_package_metadata("pkg").await.unwrap();
        assert!(pkg.versions.is_empty());
        assert!(pkg.dist_tags.is_empty());
    }

    #[tokio::test]
    async fn test_search_walks_scoped_packages() {
        let (_dir, storage) = storage().await;
        storage.add_package("plain", published("plain")).await.unwrap();
        storage.add_package("@scope/nested", published("@scope/nested")).await.unwrap();

        let records: Vec<Value> = storage
            .search(0, &SearchOptions::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<_> = records.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["@scope/nested", "plain"]);

        let none: Vec<Value> = storage
            .search(u64::MAX / 2, &SearchOptions::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (_dir, storage) = storage().await;
        assert!(matches!(
            storage.get_package_metadata("../outside").await,
            Err(StorageError::BadRequest(_))
        ));
        assert!(matches!(
            storage.add_tarball("pkg", "../../evil.tgz").await.err(),
            Some(StorageError::BadRequest(_))
        ));
    }
}
