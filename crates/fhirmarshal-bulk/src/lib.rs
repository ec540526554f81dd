//! FHIR Bulk Data export client.
//!
//! Drives one `$export` through its lifecycle:
//!
//! 1. submit with `Prefer: respond-async` and read the poll URL from
//!    `Content-Location` (skipped for `$export-poll-status` URLs)
//! 2. poll until the manifest arrives, honoring `Retry-After`
//! 3. download the listed files into `<output>/staging/` with bounded
//!    concurrency
//! 4. decode the staged envelopes into `<output>/output.ndjson`
//!
//! ```no_run
//! use fhirmarshal_bulk::{BulkExportClient, BulkExportConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> fhirmarshal_bulk::Result<()> {
//! let client = BulkExportClient::new(BulkExportConfig::default().with_output_dir("export"))?
//!     .with_token("token");
//! let outcome = client
//!     .run("https://fhir.example.org/fhir/$export", CancellationToken::new())
//!     .await?;
//! println!("{} lines in {}", outcome.lines_written, outcome.output.display());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod manifest;
pub mod reassemble;

pub use client::{BulkExportClient, ExportOutcome, ExportState, PollReport};
pub use config::BulkExportConfig;
pub use download::{DownloadReport, FailedDownload, download_all};
pub use error::{BulkError, Result};
pub use manifest::{FileListing, Manifest};
pub use reassemble::{ReassemblyReport, reassemble};
