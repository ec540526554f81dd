//! Error types for the PostgreSQL loader.

use fhirmarshal_transform::TransformError;
use sqlx_core::error::Error as SqlxError;

/// PostgreSQL error code for undefined table (42P01).
pub const PG_UNDEFINED_TABLE: &str = "42P01";

/// PostgreSQL error code for unique violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Errors talking to PostgreSQL.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Database error: {0}")]
    Database(#[from] SqlxError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("COPY into \"{table}\" failed: {message}")]
    Copy { table: String, message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Short hint for well-known failure codes, used when logging failed batches.
    pub fn hint(&self) -> Option<&'static str> {
        let Self::Database(err) = self else {
            return None;
        };
        if has_pg_error_code(err, PG_UNDEFINED_TABLE) {
            Some("target table does not exist; initialise the schema first")
        } else if has_pg_error_code(err, PG_UNIQUE_VIOLATION) {
            Some("a row with this id already exists")
        } else {
            None
        }
    }
}

/// Why a record cannot be turned into a row.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("Record has no usable resourceType: {0}")]
    MissingResourceType(String),

    #[error("Resource type '{0}' is not a valid table name")]
    InvalidTableName(String),

    #[error("Resource id must be a non-empty string, found {0}")]
    InvalidId(String),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Errors that stop a whole load.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] PostgresError),

    #[error("Transformation rules unavailable: {0}")]
    Rules(#[source] TransformError),
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
