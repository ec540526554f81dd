use anyhow::{Context, Result};
use fhirmarshal_bulk::{BulkExportClient, ExportOutcome};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AppConfig;
use crate::output;

pub async fn bulk_export(
    cfg: &AppConfig,
    url: &str,
    token: Option<&str>,
    cancel: CancellationToken,
) -> Result<ExportOutcome> {
    let mut client =
        BulkExportClient::new(cfg.bulk.clone()).context("Failed to build HTTP client")?;
    if let Some(token) = token {
        client = client.with_token(token);
    }

    let mut states = client.subscribe();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            debug!(%state, "Export progress");
        }
    });

    let result = client.run(url, cancel).await;
    drop(client);
    let _ = watcher.await;

    let outcome = result.with_context(|| format!("Bulk export from {url} failed"))?;
    output::print_export_outcome(&outcome);
    Ok(outcome)
}
