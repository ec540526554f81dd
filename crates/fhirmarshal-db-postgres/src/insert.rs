//! Multi-row parameterized `INSERT`.

use std::fmt::Write as _;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_postgres::PgConnection;

use crate::config::LoadMode;
use crate::error::{PostgresError, Result};
use crate::schema::{COLUMNS, STATUS_CREATED, StorageRow};
use crate::writer::BatchWriter;

/// Bind parameters per row: id, resource_type, resource.
const PARAMS_PER_ROW: usize = 3;

/// PostgreSQL accepts at most this many bind parameters per statement.
const MAX_PARAMS: usize = u16::MAX as usize;

/// Largest batch a single statement can carry.
pub const MAX_INSERT_BATCH: usize = MAX_PARAMS / PARAMS_PER_ROW;

#[derive(Debug, Clone)]
pub struct InsertWriter {
    batch_size: usize,
}

impl InsertWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_INSERT_BATCH),
        }
    }
}

#[async_trait]
impl BatchWriter for InsertWriter {
    fn mode(&self) -> LoadMode {
        LoadMode::Insert
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

        let sql = build_insert_sql(table, rows.len());
        let mut q = query(&sql);
        for row in rows {
            q = q
                .bind(row.id.as_deref())
                .bind(row.resource_type.as_str())
                .bind(&row.resource);
        }

        let result = q.execute(&mut *conn).await.map_err(PostgresError::from)?;
        Ok(result.rows_affected())
    }
}

/// Builds `INSERT INTO "<table>" (...) VALUES (...), (...)` for `rows` rows.
///
/// Missing ids are generated by the server.
pub fn build_insert_sql(table: &str, rows: usize) -> String {
    let mut sql = format!("INSERT INTO \"{table}\" ({COLUMNS}) VALUES ");
    for i in 0..rows {
        let base = i * PARAMS_PER_ROW;
        if i > 0 {
            sql.push_str(", ");
        }
        // Writing to a String cannot fail.
        let _ = write!(
            sql,
            "(COALESCE(${}::text, gen_random_uuid()::text), 0, ${}, '{STATUS_CREATED}', ${})",
            base + 1,
            base + 2,
            base + 3,
        );
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_insert_sql() {
        let sql = build_insert_sql("patient", 2);
        assert_eq!(
            sql,
            "INSERT INTO \"patient\" (id, txid, resource_type, status, resource) VALUES \
             (COALESCE($1::text, gen_random_uuid()::text), 0, $2, 'created', $3), \
             (COALESCE($4::text, gen_random_uuid()::text), 0, $5, 'created', $6)"
        );
    }

    #[test]
    fn test_batch_size_is_bounded_by_parameter_limit() {
        assert_eq!(InsertWriter::new(1000).batch_size(), 1000);
        assert_eq!(InsertWriter::new(0).batch_size(), 1);
        assert_eq!(InsertWriter::new(1_000_000).batch_size(), MAX_INSERT_BATCH);
    }
}
