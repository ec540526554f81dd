//! Streaming `COPY ... FROM STDIN` in CSV format.

use async_trait::async_trait;
use fhirmarshal_core::generate_id;
use sqlx_postgres::PgConnection;
use sysinfo::System;
use tracing::debug;

use crate::config::LoadMode;
use crate::error::{PostgresError, Result};
use crate::schema::{COLUMNS, STATUS_CREATED, StorageRow};
use crate::writer::BatchWriter;

/// Rows of batch per free megabyte of memory.
const ROWS_PER_MB: u64 = 500;

/// Bytes buffered before a chunk is sent to the server.
const SEND_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CopyWriter {
    batch_size: usize,
}

impl CopyWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Sizes the batch from currently available memory, capped at `max`.
    pub fn adaptive(max: usize) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let available = sys.available_memory();
        let batch_size = adaptive_batch_size(available, max);
        debug!(
            available_mb = available / (1024 * 1024),
            batch_size, "Sized COPY batch from available memory"
        );
        Self::new(batch_size)
    }
}

/// `min(max, available_mb * 500)`, never below one row.
pub fn adaptive_batch_size(available_bytes: u64, max: usize) -> usize {
    let by_memory = (available_bytes / (1024 * 1024)).saturating_mul(ROWS_PER_MB);
    let by_memory = usize::try_from(by_memory).unwrap_or(usize::MAX);
    by_memory.min(max).max(1)
}

/// The `COPY` statement for `table`.
pub fn copy_statement(table: &str) -> String {
    format!("COPY \"{table}\" ({COLUMNS}) FROM STDIN WITH (FORMAT csv)")
}

/// Appends one CSV record, assigning an id when the row has none.
pub fn push_csv_record(buf: &mut String, row: &StorageRow) {
    let id = row.id.clone().unwrap_or_else(generate_id);
    push_csv_field(buf, &id);
    buf.push_str(",0,");
    push_csv_field(buf, &row.resource_type);
    buf.push(',');
    push_csv_field(buf, STATUS_CREATED);
    buf.push(',');
    push_csv_field(buf, &row.resource.to_string());
    buf.push('\n');
}

fn push_csv_field(buf: &mut String, value: &str) {
    buf.push('"');
    for c in value.chars() {
        if c == '"' {
            buf.push('"');
        }
        buf.push(c);
    }
    buf.push('"');
}

#[async_trait]
impl BatchWriter for CopyWriter {
    fn mode(&self) -> LoadMode {
        LoadMode::Copy
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn write_batch(
        &self,
        conn: &mut PgConnection,
        table: &str,
        rows: &[StorageRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let copy_error = |message: String| PostgresError::Copy {
            table: table.to_string(),
            message,
        };

        let mut copy = conn
            .copy_in_raw(&copy_statement(table))
            .await
            .map_err(PostgresError::from)?;

        let mut buf = String::with_capacity(SEND_CHUNK_BYTES);
        for (i, row) in rows.iter().enumerate() {
            push_csv_record(&mut buf, row);
            if buf.len() < SEND_CHUNK_BYTES && i + 1 < rows.len() {
                continue;
            }
            let sent = copy.send(buf.as_bytes()).await.map(|_| ());
            if let Err(e) = sent {
                let message = e.to_string();
                let _ = copy.abort(message.clone()).await;
                return Err(copy_error(message));
            }
            buf.clear();
        }

        copy.finish()
            .await
            .map_err(|e| copy_error(e.to_string()))
    }
}
