//! Merges staged envelopes into one NDJSON output.
//!
//! Each staged file is a JSON object whose `data` string holds
//! newline-separated base64 pieces, one resource per piece.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{BulkError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyReport {
    pub files: usize,
    pub files_rejected: usize,
    pub lines_written: u64,
    pub lines_rejected: u64,
}

/// Decodes `files` in order and writes the lines to `output`, `batch_size`
/// lines per write.
pub fn reassemble(
    files: &[impl AsRef<Path>],
    output: &Path,
    batch_size: usize,
) -> Result<ReassemblyReport> {
    let batch_size = batch_size.max(1);
    let out = File::create(output).map_err(|e| BulkError::io(output, e))?;
    let mut out = BufWriter::new(out);
    let mut report = ReassemblyReport::default();
    let mut pending: Vec<String> = Vec::with_capacity(batch_size);

    for file in files {
        let path = file.as_ref();
        report.files += 1;

        let data = match read_envelope(path) {
            Ok(data) => data,
            Err(message) => {
                warn!(path = %path.display(), error = %message, "Skipping staged file");
                report.files_rejected += 1;
                continue;
            }
        };

        for (index, piece) in data.split('\n').enumerate() {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            match decode_piece(piece) {
                Ok(line) if !line.is_empty() => {
                    pending.push(line);
                    if pending.len() >= batch_size {
                        write_batch(&mut out, &mut pending, output)?;
                        report.lines_written += batch_size as u64;
                    }
                }
                Ok(_) => {}
                Err(message) => {
                    warn!(
                        path = %path.display(),
                        piece = index + 1,
                        error = %message,
                        "Rejected undecodable line"
                    );
                    report.lines_rejected += 1;
                }
            }
        }
    }

    report.lines_written += pending.len() as u64;
    write_batch(&mut out, &mut pending, output)?;
    out.flush().map_err(|e| BulkError::io(output, e))?;

    info!(
        output = %output.display(),
        files = report.files,
        lines = report.lines_written,
        rejected = report.lines_rejected,
        "Reassembly finished"
    );
    Ok(report)
}

fn read_envelope(path: &Path) -> std::result::Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    match value.get("data") {
        Some(Value::String(data)) => Ok(data.clone()),
        Some(_) => Err("`data` is not a string".into()),
        None => Err("missing `data`".into()),
    }
}

fn decode_piece(piece: &str) -> std::result::Result<String, String> {
    let bytes = STANDARD.decode(piece).map_err(|e| e.to_string())?;
    let text = String::from_utf8(bytes).map_err(|e| e.to_string())?;
    Ok(text.trim().to_string())
}

fn write_batch(out: &mut impl Write, pending: &mut Vec<String>, output: &Path) -> Result<()> {
    for line in pending.drain(..) {
        out.write_all(line.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .map_err(|e| BulkError::io(output, e))?;
    }
    Ok(())
}
