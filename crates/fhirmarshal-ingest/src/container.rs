//! Record iteration over a detected input.

use std::io::{BufRead, Read};

use fhirmarshal_core::{Resource, into_resource};
use serde_json::Value;

use crate::detect::Format;
use crate::error::{IngestError, RecordError, Result};
use crate::source::InputSource;

/// One input file exposed as a sequence of resources.
///
/// `next_record` yields `None` once the input is exhausted. A `Some(Err(_))`
/// concerns one record only; callers log it and keep reading unless
/// [`RecordError::is_fatal`] says otherwise.
pub trait ResourceContainer: Send {
    fn format(&self) -> Format;

    fn source(&self) -> &InputSource;

    /// Number of records, computed when the container was opened.
    fn count(&self) -> usize;

    fn next_record(&mut self) -> Option<std::result::Result<Resource, RecordError>>;

    /// Releases the underlying reader. Further calls to `next_record` yield `None`.
    fn close(&mut self);
}

/// Opens the container for a source of a known readable format.
pub fn open_container(source: InputSource, format: Format) -> Result<Box<dyn ResourceContainer>> {
    match format {
        Format::NdJson => Ok(Box::new(NdJsonContainer::open(source)?)),
        Format::SingleResource => Ok(Box::new(SingleResourceContainer::open(source))),
        other => Err(IngestError::UnsupportedFormat {
            path: source.path().to_path_buf(),
            format: other.to_string(),
        }),
    }
}

/// Newline-delimited resources. Blank lines are ignored.
pub struct NdJsonContainer {
    source: InputSource,
    reader: Option<Box<dyn BufRead + Send>>,
    count: usize,
    line: usize,
    buf: Vec<u8>,
}

impl NdJsonContainer {
    /// Pre-scans the line count, then reopens the stream at the start.
    ///
    /// Lines are read as bytes so that a line which is not UTF-8 is counted
    /// here and reported as malformed by `next_record`.
    pub fn open(source: InputSource) -> Result<Self> {
        let count = {
            let mut reader = source.reader()?;
            let mut count = 0;
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = reader
                    .read_until(b'\n', &mut buf)
                    .map_err(|e| IngestError::io(source.path(), e))?;
                if read == 0 {
                    break;
                }
                if !buf.trim_ascii().is_empty() {
                    count += 1;
                }
            }
            count
        };

        let reader = source.reader()?;
        Ok(Self {
            source,
            reader: Some(reader),
            count,
            line: 0,
            buf: Vec::new(),
        })
    }
}

impl ResourceContainer for NdJsonContainer {
    fn format(&self) -> Format {
        Format::NdJson
    }

    fn source(&self) -> &InputSource {
        &self.source
    }

    fn count(&self) -> usize {
        self.count
    }

    fn next_record(&mut self) -> Option<std::result::Result<Resource, RecordError>> {
        let reader = self.reader.as_mut()?;
        loop {
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {
                    self.line += 1;
                    let bytes = self.buf.trim_ascii();
                    if bytes.is_empty() {
                        continue;
                    }
                    return Some(parse_record(bytes, self.line));
                }
                Err(source) => {
                    self.reader = None;
                    return Some(Err(RecordError::Io {
                        line: self.line,
                        source,
                    }));
                }
            }
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// A file holding exactly one resource document.
pub struct SingleResourceContainer {
    source: InputSource,
    consumed: bool,
}

impl SingleResourceContainer {
    pub fn open(source: InputSource) -> Self {
        Self {
            source,
            consumed: false,
        }
    }
}

impl ResourceContainer for SingleResourceContainer {
    fn format(&self) -> Format {
        Format::SingleResource
    }

    fn source(&self) -> &InputSource {
        &self.source
    }

    fn count(&self) -> usize {
        1
    }

    fn next_record(&mut self) -> Option<std::result::Result<Resource, RecordError>> {
        if self.consumed {
            return None;
        }
        self.consumed = true;

        let mut bytes = Vec::new();
        let read = self
            .source
            .reader()
            .map_err(|e| match e {
                IngestError::Io { source, .. } => source,
                other => std::io::Error::other(other.to_string()),
            })
            .and_then(|mut r| r.read_to_end(&mut bytes));
        if let Err(source) = read {
            return Some(Err(RecordError::Io { line: 0, source }));
        }
        Some(parse_record(&bytes, 1))
    }

    fn close(&mut self) {
        self.consumed = true;
    }
}

fn parse_record(bytes: &[u8], line: usize) -> std::result::Result<Resource, RecordError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| RecordError::Malformed {
        line,
        message: e.to_string(),
    })?;
    into_resource(value).map_err(|_| RecordError::NotAnObject { line })
}
