//! Uplink client for npm-compatible registries over HTTP.

use std::{
    fmt,
    io::{BufReader, Read},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use depot_config::uplink::{UplinkConfig, DEFAULT_MAX_AGE};
use depot_utils::stream::{receiver_stream, RecordStream, TarballReader};
use serde::{
    de::{self, MapAccess, Visitor},
    Deserializer as _,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use ureq::{
    http::{
        header::{ACCEPT, CONTENT_LENGTH, ETAG, IF_NONE_MATCH},
        StatusCode,
    },
    Agent,
};
use url::Url;

use crate::{
    error::{RegistryError, Result},
    http_client::ClientConfig,
    metadata::RemoteMetadata,
    uplink::{SearchOptions, Uplink},
};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;
const MAX_DOCUMENT_SIZE: u64 = 512 * 1024 * 1024;
const ACCEPT_JSON: &str = "application/json;q=0.9, */*;q=0.8";

pub struct HttpUplink {
    name: String,
    url: Url,
    max_age: Duration,
    cache: bool,
    autogenerated: bool,
    agent: Agent,
}

impl HttpUplink {
    pub fn new(config: &UplinkConfig, client: &ClientConfig) -> Result<Self> {
        let url = base_url(&config.url)?;
        let agent = client.with_timeout(config.timeout()).build();

        Ok(Self {
            name: config.name.clone(),
            url,
            max_age: config.max_age(),
            cache: config.cache_enabled(),
            autogenerated: false,
            agent,
        })
    }

    /// An uplink scoped to a single tarball URL, named after its host.
    pub fn ad_hoc(url: Url, client: &ClientConfig) -> Self {
        Self {
            name: url.host_str().unwrap_or("ad-hoc").to_string(),
            url,
            max_age: DEFAULT_MAX_AGE,
            cache: true,
            autogenerated: true,
            agent: client.build(),
        }
    }

    fn package_url(&self, name: &str) -> Result<Url> {
        self.url
            .join(&escape_package_name(name))
            .map_err(|err| RegistryError::InvalidUrl(format!("{name}: {err}")))
    }
}

fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|err| RegistryError::InvalidUrl(format!("{raw}: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Scoped names keep their `@` but escape the separator: `@scope%2fname`.
fn escape_package_name(name: &str) -> String {
    match name.strip_prefix('@') {
        Some(scoped) => format!("@{}", scoped.replacen('/', "%2f", 1)),
        None => name.to_string(),
    }
}

fn read_json(agent: &Agent, url: &str, etag: Option<&str>) -> Result<(Value, Option<String>)> {
    let mut req = agent.get(url).header(ACCEPT, ACCEPT_JSON);
    if let Some(etag) = etag {
        req = req.header(IF_NONE_MATCH, etag);
    }

    let resp = req.call().map_err(RegistryError::from_transport)?;

    if resp.status() == StatusCode::NOT_MODIFIED {
        return Err(RegistryError::NotModified);
    }
    if !resp.status().is_success() {
        return Err(RegistryError::Status {
            status: resp.status().as_u16(),
            url: url.to_string(),
        });
    }

    let etag = resp
        .headers()
        .get(ETAG)
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    let mut body = resp.into_body();
    let bytes = body
        .with_config()
        .limit(MAX_DOCUMENT_SIZE)
        .read_to_vec()
        .map_err(RegistryError::from_transport)?;

    Ok((serde_json::from_slice(&bytes)?, etag))
}

/// Parses an `-/all` style body incrementally, sending each package record
/// that `options` accepts. The `_updated` stamp and non-object entries are
/// skipped. Stops early once the receiving side is gone.
fn stream_records<R: Read>(reader: R, tx: &mpsc::Sender<Result<Value>>, options: &SearchOptions) {
    let mut parser = serde_json::Deserializer::from_reader(reader);
    let sink = RecordSink {
        tx,
        options,
    };

    match (&mut parser).deserialize_map(sink) {
        Ok(()) => {}
        Err(_) if tx.is_closed() => trace!("search reader dropped"),
        Err(err) => {
            let err = if err.is_io() {
                RegistryError::from_io(err.into())
            } else {
                RegistryError::Json(err)
            };
            let _ = tx.blocking_send(Err(err));
        }
    }
}

struct RecordSink<'a> {
    tx: &'a mpsc::Sender<Result<Value>>,
    options: &'a SearchOptions,
}

impl<'de> Visitor<'de> for RecordSink<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of package records")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            let record: Value = map.next_value()?;
            if key == "_updated" || !record.is_object() || !self.options.matches(&record) {
                continue;
            }
            if self.tx.blocking_send(Ok(record)).is_err() {
                return Err(de::Error::custom("search reader dropped"));
            }
        }
        Ok(())
    }
}

fn join_error(err: tokio::task::JoinError) -> RegistryError {
    RegistryError::Custom(format!("uplink request task failed: {err}"))
}

#[async_trait]
impl Uplink for HttpUplink {
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

    async fn get_remote_metadata(&self, name: &str, etag: Option<&str>) -> Result<RemoteMetadata> {
        let url = self.package_url(name)?;
        let agent = self.agent.clone();
        let etag = etag.map(String::from);

        debug!(uplink = %self.name, url = %url, "fetching metadata");

        let (document, etag) =
            tokio::task::spawn_blocking(move || read_json(&agent, url.as_str(), etag.as_deref()))
                .await
                .map_err(join_error)??;

        Ok(RemoteMetadata {
            document,
            etag,
        })
    }

    async fn fetch_tarball(&self, url: &str) -> Result<TarballReader<RegistryError>> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let (open_tx, open_rx) = oneshot::channel::<Result<Option<u64>>>();
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(CHANNEL_DEPTH);

        debug!(uplink = %self.name, url = %url, "fetching tarball");

        tokio::task::spawn_blocking(move || {
            let resp = match agent.get(&url).call() {
                Ok(resp) => resp,
                Err(err) => {
                    let _ = open_tx.send(Err(RegistryError::from_transport(err)));
                    return;
                }
            };

            if !resp.status().is_success() {
                let _ = open_tx.send(Err(RegistryError::Status {
                    status: resp.status().as_u16(),
                    url,
                }));
                return;
            }

            let content_length = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.parse::<u64>().ok());

            if open_tx.send(Ok(content_length)).is_err() {
                return;
            }

            let mut reader = resp.into_body().into_reader();
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            trace!(url = %url, "tarball reader dropped");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(url = %url, error = %err, "tarball body failed");
                        let _ = tx.blocking_send(Err(RegistryError::from_io(err)));
                        break;
                    }
                }
            }
        });

        let content_length = open_rx.await.map_err(|_| {
            RegistryError::Custom("tarball request task ended before opening".into())
        })??;

        Ok(TarballReader::new(content_length, receiver_stream(rx)))
    }

    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> Result<RecordStream<RegistryError>> {
        let url = self
            .url
            .join(&format!("-/all/since?stale=update_after&startkey={start_key}"))
            .map_err(|err| RegistryError::InvalidUrl(err.to_string()))?;
        let agent = self.agent.clone();
        let options = options.clone();
        let (open_tx, open_rx) = oneshot::channel::<Result<()>>();
        let (tx, rx) = mpsc::channel::<Result<Value>>(CHANNEL_DEPTH);

        debug!(uplink = %self.name, url = %url, "searching");

        tokio::task::spawn_blocking(move || {
            let resp = match agent.get(url.as_str()).header(ACCEPT, ACCEPT_JSON).call() {
                Ok(resp) => resp,
                Err(err) => {
                    let _ = open_tx.send(Err(RegistryError::from_transport(err)));
                    return;
                }
            };

            if !resp.status().is_success() {
                let _ = open_tx.send(Err(RegistryError::Status {
                    status: resp.status().as_u16(),
                    url: url.to_string(),
                }));
                return;
            }

            if open_tx.send(Ok(())).is_err() {
                return;
            }

            let body = BufReader::new(resp.into_body().into_reader());
            stream_records(body, &tx, &options);
        });

        open_rx.await.map_err(|_| {
            RegistryError::Custom("search request task ended before opening".into())
        })??;

        Ok(receiver_stream(rx))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn uplink(url: &str) -> HttpUplink {
        HttpUplink::new(&UplinkConfig::new("npmjs", url), &ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_package_url_escapes_scope() {
        let uplink = uplink("https://registry.example.com/npm");

        assert_eq!(
            uplink.package_url("@types/node").unwrap().as_str(),
            "https://registry.example.com/npm/@types%2fnode"
        );
        assert_eq!(
            uplink.package_url("lodash").unwrap().as_str(),
            "https://registry.example.com/npm/lodash"
        );
    }

    #[test]
    fn test_uplink_uses_config() {
        let mut config = UplinkConfig::new("corp", "http://npm.corp.example/");
        config.maxage = Some("10m".into());
        config.cache = Some(false);
        let uplink = HttpUplink::new(&config, &ClientConfig::default()).unwrap();

        assert_eq!(uplink.name(), "corp");
        assert_eq!(uplink.max_age(), Duration::from_secs(600));
        assert!(!uplink.cache_enabled());
        assert!(!uplink.is_autogenerated());
        assert!(uplink.is_uplink_valid("http://npm.corp.example/corp/-/corp-1.0.0.tgz"));
        assert!(!uplink.is_uplink_valid("https://npm.corp.example/corp/-/corp-1.0.0.tgz"));
    }

    async fn collect_records(body: &'static [u8], options: SearchOptions) -> Vec<Result<Value>> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || stream_records(body, &tx, &options))
            .await
            .unwrap();
        receiver_stream(rx).collect().await
    }

    #[tokio::test]
    async fn test_search_body_yields_package_records() {
        let body = br#"{
            "_updated": 1700000000000,
            "left-pad": {"name": "left-pad", "description": "pads strings"},
            "broken": 3,
            "lodash": {"name": "lodash"}
        }"#;

        let records = collect_records(body, SearchOptions::default()).await;
        let names: Vec<_> = records
            .into_iter()
            .map(|record| record.unwrap()["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["left-pad", "lodash"]);

        let options = SearchOptions {
            local_only: false,
            query: Some("PAD".into()),
        };
        let records = collect_records(body, options).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap()["name"], "left-pad");
    }

    #[tokio::test]
    async fn test_truncated_search_body_ends_with_error() {
        let body = br#"{"left-pad": {"name": "left-pad"}, "lodash": {"na"#;

        let records = collect_records(body, SearchOptions::default()).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_ref().unwrap()["name"], "left-pad");
        assert!(matches!(records[1], Err(RegistryError::Json(_))));
    }

    #[tokio::test]
    async fn test_search_body_stops_when_reader_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let body: &'static [u8] = br#"{"a": {"name": "a"}, "b": {"name": "b"}}"#;

        tokio::task::spawn_blocking(move || stream_records(body, &tx, &SearchOptions::default()))
            .await
            .unwrap();
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpUplink::new(
            &UplinkConfig::new("bad", "not a url"),
            &ClientConfig::default(),
        );
        assert!(matches!(result, Err(RegistryError::InvalidUrl(_))));
    }
}
