#[allow(dead_code)]
pub mod fixtures;
#[allow(dead_code)]
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{handler, local_package, registry, remote_document, rules, sync_engine, tarball_url};
#[allow(unused_imports)]
pub use mocks::{InstrumentedStorage, MockUplink, SearchGauge};
