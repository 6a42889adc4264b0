use std::path::{Path, PathBuf};

use depot_core::{ErrorContext, Result, StorageHandler};
use futures::StreamExt;
use nu_ansi_term::Color::{Blue, Cyan};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::utils::Colored;

pub async fn fetch_tarball(
    handler: &StorageHandler,
    name: &str,
    filename: &str,
    output: Option<String>,
) -> Result<()> {
    let mut stream = handler.get_tarball(name, filename).await?;
    let path = output.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(filename));
    debug!(
        package = name,
        filename,
        content_length = ?stream.content_length(),
        "downloading tarball"
    );

    let mut file = fs::File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(file);
                discard(&path).await;
                return Err(err);
            }
        };
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;

    info!(
        package = name,
        filename,
        bytes = written,
        "Saved {} to {} ({} bytes)",
        Colored(Blue, filename),
        path.display(),
        Colored(Cyan, written)
    );
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        warn!("failed to remove partial download {}: {err}", path.display());
    }
}
