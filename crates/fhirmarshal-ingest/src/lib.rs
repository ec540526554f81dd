//! Input handling for FhirMarshal.
//!
//! Inputs are files (optionally gzip-compressed) or directories of files.
//! Each file is sniffed into a [`Format`] and wrapped in a
//! [`ResourceContainer`] that yields resources one at a time:
//!
//! ```no_run
//! use fhirmarshal_ingest::ContainerAggregate;
//!
//! let aggregate = ContainerAggregate::open(&["data/"])?;
//! println!("{} records in {} files", aggregate.total_records(), aggregate.len());
//! for mut container in aggregate.into_containers() {
//!     while let Some(record) = container.next_record() {
//!         // ...
//!         # let _ = record;
//!     }
//! }
//! # Ok::<(), fhirmarshal_ingest::IngestError>(())
//! ```

pub mod aggregate;
pub mod container;
pub mod detect;
pub mod error;
pub mod source;

pub use aggregate::{ContainerAggregate, SkipReason, SkippedInput};
pub use container::{NdJsonContainer, ResourceContainer, SingleResourceContainer, open_container};
pub use detect::{Format, detect};
pub use error::{IngestError, RecordError, Result};
pub use source::InputSource;
