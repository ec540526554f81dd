use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use fhirmarshal_db_postgres::{LoadSummary, Loader, create_pool, mask_password};
use fhirmarshal_ingest::ContainerAggregate;
use fhirmarshal_transform::{RuleTableCache, TransformEngine};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::output;

pub async fn load(
    cfg: &AppConfig,
    inputs: &[PathBuf],
    cancel: CancellationToken,
) -> Result<LoadSummary> {
    let aggregate = ContainerAggregate::open(inputs).context("Failed to open inputs")?;
    output::print_skipped_inputs(aggregate.skipped());

    let total = aggregate.total_records() as u64;
    info!(
        containers = aggregate.len(),
        records = total,
        skipped_inputs = aggregate.skipped().len(),
        "Inputs opened"
    );

    let pool_config = cfg
        .storage
        .postgres
        .pool_config()
        .map_err(|e| anyhow!(e))?;
    let pool = create_pool(&pool_config)
        .await
        .with_context(|| format!("Failed to connect to {}", mask_password(&pool_config.url)))?;

    let cache = Arc::new(RuleTableCache::new(&cfg.transform.rules_dir));
    let engine = TransformEngine::new(cache);

    let done = Arc::new(AtomicU64::new(0));
    let loader = Loader::new(pool.clone(), engine, cfg.loader_config()).with_flush_callback(
        move |report| {
            let written = done.fetch_add(report.written, Ordering::Relaxed) + report.written;
            info!(
                table = %report.table,
                rows = report.rows,
                progress = %format!("{written}/{total}"),
                "Batch flushed"
            );
        },
    );

    let result = loader.load(aggregate, cancel).await;
    pool.close().await;
    let summary = result.context("Load failed")?;

    output::print_load_summary(&summary);
    Ok(summary)
}
