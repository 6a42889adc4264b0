use depot_core::{Result, StorageHandler};
use depot_registry::SearchOptions;
use futures::StreamExt;
use nu_ansi_term::Color::{Blue, Cyan, LightRed};
use serde_json::Value;
use tracing::{debug, info};

use crate::utils::{str_field, Colored};

pub async fn search_packages(
    handler: &StorageHandler,
    query: Option<String>,
    since: Option<u64>,
    local: bool,
    limit: Option<usize>,
) -> Result<()> {
    debug!(query = ?query, since = ?since, local, limit = ?limit, "searching packages");

    let options = SearchOptions {
        local_only: local,
        query,
    };
    let mut stream = handler.search(since.unwrap_or(0), options);

    let mut count = 0usize;
    while let Some(record) = stream.next().await {
        let name = str_field(&record, "name");
        let version = record
            .get("dist-tags")
            .and_then(|tags| tags.get("latest"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        info!(
            name = name,
            version = version,
            description = str_field(&record, "description"),
            "{}@{} - {}",
            Colored(Blue, name),
            Colored(LightRed, version),
            str_field(&record, "description")
        );

        count += 1;
        if limit.is_some_and(|limit| count >= limit) {
            stream.abort();
            break;
        }
    }

    info!("{} packages found", Colored(Cyan, count));
    Ok(())
}
