//! Error types for input handling.

use std::path::PathBuf;

/// Errors that stop an input (or the whole ingest) from being used.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Detection did not yield a readable format.
    #[error("Unsupported input format for {}: {format}", path.display())]
    UnsupportedFormat { path: PathBuf, format: String },

    /// None of the inputs could be opened.
    #[error("No readable inputs among {count} path(s)")]
    NoReadableInputs { count: usize },
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors for a single record. The container stays usable after one.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Malformed JSON at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Record at line {line} is not a JSON object")]
    NotAnObject { line: usize },

    #[error("Read error after line {line}: {source}")]
    Io {
        line: usize,
        #[source]
        source: std::io::Error,
    },
}

impl RecordError {
    /// Line (1-based) the error refers to.
    pub fn line(&self) -> usize {
        match self {
            Self::Malformed { line, .. } | Self::NotAnObject { line } | Self::Io { line, .. } => {
                *line
            }
        }
    }

    /// Read errors leave the stream in an unknown state; iteration should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
