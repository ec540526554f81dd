//! On-disk input, optionally gzip-compressed.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::{IngestError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// A file to read records from.
///
/// Compression is sniffed once from the first two bytes. Every call to
/// [`InputSource::reader`] opens a fresh stream positioned at the start, which
/// is how containers rewind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    path: PathBuf,
    compressed: bool,
}

impl InputSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).map_err(|e| IngestError::io(&path, e))?;

        let mut magic = [0u8; 2];
        let mut filled = 0;
        while filled < magic.len() {
            match file.read(&mut magic[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestError::io(&path, e)),
            }
        }

        Ok(Self {
            compressed: filled == 2 && magic == GZIP_MAGIC,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Opens a decompressed reader at the start of the file.
    pub fn reader(&self) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(&self.path).map_err(|e| IngestError::io(&self.path, e))?;
        if self.compressed {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(
                file,
            )))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }
}
