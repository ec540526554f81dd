//! Streaming load of containers into PostgreSQL.
//!
//! Every container gets its own task. Inside a task a blocking reader parses
//! and transforms records in order and hands rows over a bounded channel to
//! the async side, which batches them per table and flushes through the
//! configured [`BatchWriter`]. Tasks never share a connection.
//!
//! Nothing here aborts a load once it started: unreadable records, records
//! that fail to transform or route, and failed batches are logged with their
//! source and counted in the [`LoadSummary`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fhirmarshal_ingest::{ContainerAggregate, ResourceContainer};
use fhirmarshal_transform::TransformEngine;
use sqlx_core::pool::PoolConnection;
use sqlx_postgres::{PgPool, Postgres};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LoaderConfig;
use crate::error::{LoadError, PostgresError, RowError};
use crate::pool::test_connection;
use crate::schema::StorageRow;
use crate::writer::{BatchWriter, writer_for};

/// Called after every flush.
pub type FlushCallback = Arc<dyn Fn(&FlushReport) + Send + Sync>;

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub resource_type: String,
    pub table: String,
    /// Rows in the batch.
    pub rows: usize,
    /// Rows the database reported as written.
    pub written: u64,
    pub elapsed: Duration,
    /// Set when the batch could not be written.
    pub error: Option<String>,
}

impl FlushReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub rows: u64,
    pub batches: u64,
    pub elapsed: Duration,
}

/// Totals for a load, or for one container while it runs.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub containers: usize,
    /// Containers whose task died before finishing.
    pub failed_containers: usize,
    pub records_read: u64,
    pub rows_written: u64,
    /// Records dropped before reaching a batch.
    pub skipped: u64,
    pub failed_batches: u64,
    /// Rows left in batches when the load was cancelled.
    pub unflushed: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub per_type: BTreeMap<String, TypeStats>,
}

impl LoadSummary {
    fn merge(&mut self, other: LoadSummary) {
        self.containers += other.containers;
        self.failed_containers += other.failed_containers;
        self.records_read += other.records_read;
        self.rows_written += other.rows_written;
        self.skipped += other.skipped;
        self.failed_batches += other.failed_batches;
        self.unflushed += other.unflushed;
        self.cancelled |= other.cancelled;
        for (rt, stats) in other.per_type {
            let entry = self.per_type.entry(rt).or_default();
            entry.rows += stats.rows;
            entry.batches += stats.batches;
            entry.elapsed += stats.elapsed;
        }
    }

    fn record_flush(&mut self, report: &FlushReport) {
        let entry = self.per_type.entry(report.resource_type.clone()).or_default();
        entry.batches += 1;
        entry.elapsed += report.elapsed;
        if report.succeeded() {
            entry.rows += report.written;
            self.rows_written += report.written;
        } else {
            self.failed_batches += 1;
        }
    }
}

/// Rows bound for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub table: String,
    pub resource_type: String,
    pub rows: Vec<StorageRow>,
}

/// Accumulates rows per table and releases a batch once it is full.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    pending: HashMap<String, Batch>,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pending: HashMap::new(),
        }
    }

    /// Adds a row; returns the table's batch when it reached the batch size.
    pub fn push(&mut self, row: StorageRow) -> Option<Batch> {
        let batch_size = self.batch_size;
        let batch = self
            .pending
            .entry(row.table.clone())
            .or_insert_with(|| Batch {
                table: row.table.clone(),
                resource_type: row.resource_type.clone(),
                rows: Vec::with_capacity(batch_size),
            });
        batch.rows.push(row);

        if batch.rows.len() >= batch_size {
            let table = batch.table.clone();
            self.pending.remove(&table)
        } else {
            None
        }
    }

    /// Takes every partial batch, ordered by table name.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self.pending.drain().map(|(_, b)| b).collect();
        batches.sort_by(|a, b| a.table.cmp(&b.table));
        batches
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.values().map(|b| b.rows.len()).sum()
    }
}

/// What the reader hands to the writer side for each record.
#[derive(Debug)]
enum Prepared {
    Row(StorageRow),
    Skipped,
}

/// Loads containers into PostgreSQL.
pub struct Loader {
    pool: PgPool,
    engine: TransformEngine,
    config: LoaderConfig,
    writer: Arc<dyn BatchWriter>,
    on_flush: Option<FlushCallback>,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("mode", &self.writer.mode())
            .field("batch_size", &self.writer.batch_size())
            .field("fhir_version", &self.config.fhir_version)
            .finish()
    }
}

impl Loader {
    pub fn new(pool: PgPool, engine: TransformEngine, config: LoaderConfig) -> Self {
        let writer = writer_for(&config);
        Self {
            pool,
            engine,
            config,
            writer,
            on_flush: None,
        }
    }

    /// Replaces the writer picked from the configured mode.
    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn BatchWriter>) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn with_flush_callback(
        mut self,
        callback: impl Fn(&FlushReport) + Send + Sync + 'static,
    ) -> Self {
        self.on_flush = Some(Arc::new(callback));
        self
    }

    /// Loads every container of `aggregate`, each in its own task.
    ///
    /// Fails before touching any input when the rule table cannot be loaded
    /// or the database is unreachable. After that, problems are counted in
    /// the summary rather than returned.
    #[instrument(skip_all, fields(mode = %self.writer.mode(), containers = aggregate.len()))]
    pub async fn load(
        &self,
        aggregate: ContainerAggregate,
        cancel: CancellationToken,
    ) -> Result<LoadSummary, LoadError> {
        let version = self.config.fhir_version.clone();
        self.engine
            .cache()
            .preload(&version)
            .map_err(LoadError::Rules)?;
        test_connection(&self.pool).await?;

        info!(
            containers = aggregate.len(),
            records = aggregate.total_records(),
            batch_size = self.writer.batch_size(),
            fhir_version = %version,
            "Starting load"
        );

        let ctx = Arc::new(TaskContext {
            pool: self.pool.clone(),
            engine: self.engine.clone(),
            version,
            writer: Arc::clone(&self.writer),
            on_flush: self.on_flush.clone(),
            channel_capacity: self.config.channel_capacity.max(1),
        });

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for container in aggregate.into_containers() {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tasks.spawn(async move { ctx.consume(container, cancel).await });
        }

        let mut summary = LoadSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(stats) => summary.merge(stats),
                Err(e) => {
                    error!(error = %e, "Container task failed");
                    summary.containers += 1;
                    summary.failed_containers += 1;
                }
            }
        }
        summary.elapsed = started.elapsed();
        summary.cancelled |= cancel.is_cancelled();

        info!(
            records = summary.records_read,
            rows = summary.rows_written,
            skipped = summary.skipped,
            failed_batches = summary.failed_batches,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            cancelled = summary.cancelled,
            "Load finished"
        );
        Ok(summary)
    }
}

struct TaskContext {
    pool: PgPool,
    engine: TransformEngine,
    version: String,
    writer: Arc<dyn BatchWriter>,
    on_flush: Option<FlushCallback>,
    channel_capacity: usize,
}

impl TaskContext {
    async fn consume(
        self: Arc<Self>,
        container: Box<dyn ResourceContainer>,
        cancel: CancellationToken,
    ) -> LoadSummary {
        let source = container.source().path().display().to_string();
        let mut stats = LoadSummary {
            containers: 1,
            ..Default::default()
        };
        debug!(source = %source, records = container.count(), "Consuming container");

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let reader = {
            let engine = self.engine.clone();
            let version = self.version.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                read_container(container, &engine, &version, &tx, &cancel)
            })
        };

        let mut batcher = Batcher::new(self.writer.batch_size());
        let mut conn: Option<PoolConnection<Postgres>> = None;

        while let Some(prepared) = rx.recv().await {
            stats.records_read += 1;
            let row = match prepared {
                Prepared::Row(row) => row,
                Prepared::Skipped => {
                    stats.skipped += 1;
                    continue;
                }
            };
            if let Some(batch) = batcher.push(row) {
                if cancel.is_cancelled() {
                    stats.unflushed += batch.rows.len() as u64;
                    break;
                }
                self.flush(&mut conn, batch, &source, &mut stats).await;
            }
        }
        drop(rx);

        if cancel.is_cancelled() {
            stats.cancelled = true;
            stats.unflushed += batcher.pending_rows() as u64;
            warn!(source = %source, unflushed = stats.unflushed, "Load cancelled");
        } else {
            for batch in batcher.drain() {
                self.flush(&mut conn, batch, &source, &mut stats).await;
            }
        }

        if let Err(e) = reader.await {
            error!(source = %source, error = %e, "Reader task failed");
            stats.failed_containers += 1;
        }

        debug!(
            source = %source,
            records = stats.records_read,
            rows = stats.rows_written,
            skipped = stats.skipped,
            "Container done"
        );
        stats
    }

    async fn flush(
        &self,
        conn: &mut Option<PoolConnection<Postgres>>,
        batch: Batch,
        source: &str,
        stats: &mut LoadSummary,
    ) {
        let started = Instant::now();
        let result = self.write(conn, &batch).await;
        let elapsed = started.elapsed();

        let (written, error) = match result {
            Ok(n) => {
                debug!(
                    table = %batch.table,
                    rows = batch.rows.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flushed batch"
                );
                (n, None)
            }
            Err(e) => {
                warn!(
                    source = %source,
                    table = %batch.table,
                    rows = batch.rows.len(),
                    first_id = ?batch.rows.first().and_then(|r| r.id.as_deref()),
                    error = %e,
                    hint = e.hint().unwrap_or(""),
                    "Batch write failed, continuing with next batch"
                );
                // The connection may be broken; take a fresh one next time.
                *conn = None;
                (0, Some(e.to_string()))
            }
        };

        let report = FlushReport {
            resource_type: batch.resource_type,
            table: batch.table,
            rows: batch.rows.len(),
            written,
            elapsed,
            error,
        };
        stats.record_flush(&report);
        if let Some(callback) = &self.on_flush {
            callback(&report);
        }
    }

    async fn write(
        &self,
        conn: &mut Option<PoolConnection<Postgres>>,
        batch: &Batch,
    ) -> Result<u64, PostgresError> {
        let current = match conn.take() {
            Some(c) => c,
            None => self.pool.acquire().await?,
        };
        let current = conn.insert(current);
        self.writer
            .write_batch(&mut **current, &batch.table, &batch.rows)
            .await
    }
}

/// Reads, transforms and routes every record of `container` in order.
///
/// Runs on a blocking thread. Stops early when the receiver is gone or the
/// load is cancelled.
fn read_container(
    mut container: Box<dyn ResourceContainer>,
    engine: &TransformEngine,
    version: &str,
    tx: &mpsc::Sender<Prepared>,
    cancel: &CancellationToken,
) {
    let source = container.source().path().display().to_string();
    let mut index = 0usize;

    while let Some(record) = container.next_record() {
        if cancel.is_cancelled() {
            break;
        }
        index += 1;

        let mut stop = false;
        let prepared = match record {
            Err(e) => {
                warn!(
                    source = %source,
                    index,
                    line = e.line(),
                    error = %e,
                    "Skipping unreadable record"
                );
                stop = e.is_fatal();
                Prepared::Skipped
            }
            Ok(resource) => {
                let routed = engine
                    .transform(&resource, version)
                    .map_err(RowError::from)
                    .and_then(StorageRow::from_resource);
                match routed {
                    Ok(row) => Prepared::Row(row),
                    Err(e) => {
                        warn!(
                            source = %source,
                            index,
                            id = ?fhirmarshal_core::resource_id(&resource),
                            error = %e,
                            "Skipping record"
                        );
                        Prepared::Skipped
                    }
                }
            }
        };

        if tx.blocking_send(prepared).is_err() || stop {
            break;
        }
    }
    container.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirmarshal_ingest::{Format, InputSource, open_container};
    use fhirmarshal_transform::{RuleTable, RuleTableCache};
    use serde_json::{Value, json};

    fn row(rt: &str, id: &str) -> StorageRow {
        StorageRow {
            id: Some(id.to_string()),
            resource_type: rt.to_string(),
            table: rt.to_lowercase(),
            resource: json!({"resourceType": rt, "id": id}),
        }
    }

    #[test]
    fn test_batcher_flushes_per_table() {
        let mut b = Batcher::new(2);
        assert!(b.push(row("Patient", "1")).is_none());
        assert!(b.push(row("Observation", "1")).is_none());

        let full = b.push(row("Patient", "2")).unwrap();
        assert_eq!(full.table, "patient");
        assert_eq!(full.resource_type, "Patient");
        assert_eq!(full.rows.len(), 2);
        assert_eq!(b.pending_rows(), 1);

        b.push(row("Encounter", "1"));
        let rest = b.drain();
        let tables: Vec<&str> = rest.iter().map(|b| b.table.as_str()).collect();
        assert_eq!(tables, vec!["encounter", "observation"]);
        assert_eq!(b.pending_rows(), 0);
    }

    #[test]
    fn test_summary_merge_and_flush_accounting() {
        let mut a = LoadSummary {
            containers: 1,
            records_read: 3,
            ..Default::default()
        };
        a.record_flush(&FlushReport {
            resource_type: "Patient".into(),
            table: "patient".into(),
            rows: 2,
            written: 2,
            elapsed: Duration::from_millis(5),
            error: None,
        });
        let mut b = LoadSummary {
            containers: 1,
            records_read: 1,
            ..Default::default()
        };
        b.record_flush(&FlushReport {
            resource_type: "Patient".into(),
            table: "patient".into(),
            rows: 1,
            written: 0,
            elapsed: Duration::from_millis(1),
            error: Some("connection reset".into()),
        });

        a.merge(b);
        assert_eq!(a.containers, 2);
        assert_eq!(a.records_read, 4);
        assert_eq!(a.rows_written, 2);
        assert_eq!(a.failed_batches, 1);
        let patient = &a.per_type["Patient"];
        assert_eq!(patient.rows, 2);
        assert_eq!(patient.batches, 2);
        assert_eq!(patient.elapsed, Duration::from_millis(6));
    }

    #[tokio::test]
    async fn test_reader_skips_bad_records_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.ndjson");
        std::fs::write(
            &path,
            [
                r#"{"resourceType":"Observation","id":"o1","subject":{"reference":"Patient/1"}}"#,
                r#"{not json"#,
                r#"{"id":"no-type"}"#,
                r#"{"resourceType":"Bad Type","id":"x"}"#,
                r#"{"resourceType":"Observation","id":"o2"}"#,
            ]
            .join("\n"),
        )
        .unwrap();

        let cache = RuleTableCache::new(dir.path());
        cache.insert(
            "4.0.0",
            RuleTable::from_value(&json!({"Observation": {"subject": {"tr/act": "reference"}}}))
                .unwrap(),
        );
        let engine = TransformEngine::new(Arc::new(cache));
        let container = open_container(InputSource::open(&path).unwrap(), Format::NdJson).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let reader = tokio::task::spawn_blocking(move || {
            read_container(container, &engine, "4.0.0", &tx, &cancel)
        });

        let mut rows = Vec::new();
        let mut skipped = 0;
        while let Some(p) = rx.recv().await {
            match p {
                Prepared::Row(r) => rows.push(r),
                Prepared::Skipped => skipped += 1,
            }
        }
        reader.await.unwrap();

        assert_eq!(skipped, 3);
        let ids: Vec<Option<&str>> = rows.iter().map(|r| r.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("o1"), Some("o2")]);
        assert_eq!(
            rows[0].resource["subject"],
            json!({"id": "1", "resourceType": "Patient"})
        );
        assert_eq!(rows[0].resource["resourceType"], Value::from("Observation"));
    }
}
