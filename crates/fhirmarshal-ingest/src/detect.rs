//! Input format detection.

use std::fmt;
use std::io::{BufRead, Read};

use serde_json::Value;

use crate::source::InputSource;

/// Layout of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// One resource per line.
    NdJson,
    /// One JSON resource document.
    SingleResource,
    /// A FHIR `Bundle` document. Recognised but not loaded.
    UnsupportedBundle,
    Unknown,
}

impl Format {
    /// Whether containers can be built for this format.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::NdJson | Self::SingleResource)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NdJson => "ndjson",
            Self::SingleResource => "single-resource",
            Self::UnsupportedBundle => "bundle (unsupported)",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Detects the format of `source`.
///
/// Never fails: any read or parse problem yields [`Format::Unknown`].
pub fn detect(source: &InputSource) -> Format {
    let classified = source
        .reader()
        .map_err(|e| e.to_string())
        .and_then(classify);

    match classified {
        Ok(format) => format,
        Err(reason) => {
            tracing::debug!(
                source = %source.path().display(),
                reason = %reason,
                "Format detection failed"
            );
            Format::Unknown
        }
    }
}

/// Classifies a decompressed stream.
///
/// Two leading lines that are each a complete JSON object mean NDJSON.
/// Otherwise the whole stream is parsed as one document and classified by
/// its `resourceType`.
pub fn classify(mut reader: impl BufRead) -> Result<Format, String> {
    let mut first = Vec::new();
    reader
        .read_until(b'\n', &mut first)
        .map_err(|e| e.to_string())?;
    if first.trim_ascii().is_empty() {
        return Ok(Format::Unknown);
    }

    let mut second = Vec::new();
    let read = reader
        .read_until(b'\n', &mut second)
        .map_err(|e| e.to_string())?;
    if read == 0 {
        return classify_document(first.as_slice());
    }

    if is_json_object(&first) && is_json_object(&second) {
        return Ok(Format::NdJson);
    }

    classify_document(first.as_slice().chain(second.as_slice()).chain(reader))
}

fn is_json_object(line: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<Value>(line.trim_ascii()),
        Ok(Value::Object(_))
    )
}

fn classify_document(reader: impl Read) -> Result<Format, String> {
    let doc: Value = serde_json::from_reader(reader).map_err(|e| e.to_string())?;
    let Value::Object(root) = doc else {
        return Err("root is not a JSON object".to_string());
    };

    Ok(match root.get("resourceType").and_then(Value::as_str) {
        Some("Bundle") => Format::UnsupportedBundle,
        Some(rt) if !rt.is_empty() => Format::SingleResource,
        _ => Format::Unknown,
    })
}
