//! Bulk export client settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for [`BulkExportClient`](crate::BulkExportClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkExportConfig {
    /// `Accept` header sent with every request.
    pub accept_header: String,

    /// Directory receiving `staging/` and `output.ndjson`.
    #[serde(alias = "output")]
    pub output_dir: PathBuf,

    /// Concurrent file downloads.
    pub num_dl: usize,

    /// Poll attempts before the export is given up.
    pub max_retries: u32,

    /// Wait used when a `202` carries no usable `Retry-After`.
    pub default_retry_after_secs: u64,

    /// Base wait after a transient failure, multiplied by the attempt number.
    pub error_backoff_secs: u64,

    /// Attempts per file download.
    pub download_retries: u32,

    /// Lines buffered before the merged output is written.
    pub reassembly_batch_size: usize,

    /// Total deadline of a submit or poll request.
    pub request_timeout_secs: u64,

    /// Deadline for establishing a connection.
    pub connect_timeout_secs: u64,

    /// Longest pause between two reads of a response body. File downloads
    /// have no total deadline, only this one.
    pub read_timeout_secs: u64,

    /// Length of one "second" of waiting, in milliseconds. Only tests change it.
    pub time_unit_ms: u64,
}

impl Default for BulkExportConfig {
    fn default() -> Self {
        Self {
            accept_header: "application/fhir+json".into(),
            output_dir: PathBuf::from("output"),
            num_dl: 5,
            max_retries: 5,
            default_retry_after_secs: 120,
            error_backoff_secs: 5,
            download_retries: 3,
            reassembly_batch_size: 1000,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            time_unit_ms: 1000,
        }
    }
}

impl BulkExportConfig {
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_num_dl(mut self, n: usize) -> Self {
        self.num_dl = n;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    #[must_use]
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.time_unit_ms = unit.as_millis() as u64;
        self
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join("staging")
    }

    pub fn output_file(&self) -> PathBuf {
        self.output_dir.join("output.ndjson")
    }

    /// `secs` scaled by the time unit.
    pub(crate) fn scaled(&self, secs: u64) -> Duration {
        Duration::from_millis(secs.saturating_mul(self.time_unit_ms))
    }
}
