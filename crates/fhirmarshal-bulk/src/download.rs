//! Concurrent, bounded download of manifest files into the staging area.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::BulkExportClient;
use crate::error::{BulkError, Result};
use crate::manifest::FileListing;

/// A file that could not be staged.
#[derive(Debug, Clone)]
pub struct FailedDownload {
    pub listing: FileListing,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Staged files, sorted by path (manifest order).
    pub staged: Vec<PathBuf>,
    pub failed: Vec<FailedDownload>,
}

/// Downloads every listing, at most `num_dl` at a time.
///
/// A failed file is retried `download_retries` times and then reported in
/// [`DownloadReport::failed`]; it never aborts the other downloads. After
/// cancellation no new download starts.
pub async fn download_all(
    client: &BulkExportClient,
    listings: &[FileListing],
    cancel: &CancellationToken,
) -> Result<DownloadReport> {
    let staging = client.config().staging_dir();
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| BulkError::io(&staging, e))?;

    let permits = Arc::new(Semaphore::new(client.config().num_dl.max(1)));
    let mut tasks = JoinSet::new();

    for (index, listing) in listings.iter().cloned().enumerate() {
        let client = client.clone();
        let permits = Arc::clone(&permits);
        let cancel = cancel.clone();
        let dest = staging.join(listing.staging_name(index));

        tasks.spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = cancel.cancelled() => return (listing, Err(BulkError::Cancelled)),
            };
            if cancel.is_cancelled() {
                return (listing, Err(BulkError::Cancelled));
            }
            let result = download_with_retries(&client, &listing, &dest, &cancel).await;
            (listing, result.map(|()| dest))
        });
    }

    let mut report = DownloadReport::default();
    while let Some(joined) = tasks.join_next().await {
        let (listing, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Download task panicked");
                continue;
            }
        };
        match result {
            Ok(path) => report.staged.push(path),
            Err(BulkError::Cancelled) => {
                debug!(url = %listing.url, "Download not started, export cancelled");
            }
            Err(e) => {
                warn!(
                    resource_type = %listing.resource_type,
                    url = %listing.url,
                    error = %e,
                    "Download failed"
                );
                report.failed.push(FailedDownload {
                    listing,
                    error: e.to_string(),
                });
            }
        }
    }

    report.staged.sort();
    info!(
        staged = report.staged.len(),
        failed = report.failed.len(),
        "Downloads finished"
    );
    Ok(report)
}

async fn download_with_retries(
    client: &BulkExportClient,
    listing: &FileListing,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = client.config();
    let attempts = config.download_retries.max(1);
    let mut attempt = 1;
    loop {
        match download_one(client, &listing.url, dest).await {
            Ok(bytes) => {
                debug!(url = %listing.url, path = %dest.display(), bytes, "File staged");
                return Ok(());
            }
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(url = %listing.url, attempt, error = %e, "Download attempt failed, retrying");
                let wait = config.scaled(config.error_backoff_secs.saturating_mul(u64::from(attempt)));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(BulkError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

/// Streams one file to `dest` through a `.part` file.
async fn download_one(client: &BulkExportClient, url: &str, dest: &Path) -> Result<u64> {
    let mut response = client.request(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(BulkError::Status {
            url: url.to_string(),
            status,
        });
    }

    let part = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| BulkError::io(&part, e))?;
    let mut bytes = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| BulkError::io(&part, e))?;
        bytes += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| BulkError::io(&part, e))?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| BulkError::io(dest, e))?;
    Ok(bytes)
}
