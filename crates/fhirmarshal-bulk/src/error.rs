//! Error types for the bulk export client.

use std::path::PathBuf;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },

    #[error("Export request accepted without a Content-Location header")]
    MissingContentLocation,

    #[error("Export not ready after {attempts} poll attempts")]
    PollExhausted { attempts: u32 },

    #[error("Invalid export manifest: {0}")]
    Manifest(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Export cancelled")]
    Cancelled,
}

impl BulkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BulkError>;
