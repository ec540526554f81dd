//! Batch write strategies.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_postgres::PgConnection;

use crate::config::{LoadMode, LoaderConfig};
use crate::copy::CopyWriter;
use crate::error::Result;
use crate::insert::InsertWriter;
use crate::schema::StorageRow;

/// Writes one batch of rows, all bound for the same table.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    fn mode(&self) -> LoadMode;

    /// Rows to accumulate per table before flushing.
    fn batch_size(&self) -> usize;

    /// Writes `rows` into `table`, returning the number of rows stored.
    async fn write_batch(
        &self,
        conn: &mut PgConnection,
        table: &str,
        rows: &[StorageRow],
    ) -> Result<u64>;
}

/// Builds the writer for the configured mode.
pub fn writer_for(config: &LoaderConfig) -> Arc<dyn BatchWriter> {
    match config.mode {
        LoadMode::Insert => Arc::new(InsertWriter::new(config.batch_size)),
        LoadMode::Copy => Arc::new(CopyWriter::adaptive(config.max_copy_batch_size)),
    }
}
