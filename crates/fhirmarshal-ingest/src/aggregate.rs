//! The set of containers for one load.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::container::{ResourceContainer, open_container};
use crate::detect::{Format, detect};
use crate::error::{IngestError, Result};
use crate::source::InputSource;

/// Why an input was left out of the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownFormat,
    UnsupportedBundle,
    Io(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFormat => f.write_str("cannot determine input format"),
            Self::UnsupportedBundle => f.write_str("FHIR Bundle inputs are not supported"),
            Self::Io(e) => write!(f, "cannot read input: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedInput {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Containers opened from a list of files and directories.
///
/// Records are never interleaved across containers; each container is meant
/// to be consumed on its own.
pub struct ContainerAggregate {
    containers: Vec<Box<dyn ResourceContainer>>,
    skipped: Vec<SkippedInput>,
}

impl ContainerAggregate {
    /// Opens every input. Directories expand to their direct files, sorted by
    /// name. Inputs that cannot be read or detected are logged and skipped.
    ///
    /// Fails only when nothing at all could be opened.
    pub fn open<P: AsRef<Path>>(inputs: &[P]) -> Result<Self> {
        let mut files = Vec::new();
        let mut skipped = Vec::new();

        for input in inputs {
            let input = input.as_ref();
            if input.is_dir() {
                match list_dir(input) {
                    Ok(mut entries) => files.append(&mut entries),
                    Err(e) => skipped.push(skip(input, SkipReason::Io(e.to_string()))),
                }
            } else {
                files.push(input.to_path_buf());
            }
        }

        let mut containers = Vec::with_capacity(files.len());
        for path in files {
            match open_one(&path) {
                Ok(container) => {
                    tracing::debug!(
                        source = %path.display(),
                        format = %container.format(),
                        records = container.count(),
                        "Opened input"
                    );
                    containers.push(container);
                }
                Err(reason) => skipped.push(skip(&path, reason)),
            }
        }

        if containers.is_empty() {
            return Err(IngestError::NoReadableInputs {
                count: skipped.len(),
            });
        }

        Ok(Self {
            containers,
            skipped,
        })
    }

    /// Number of containers.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Sum of the record counts of all containers.
    pub fn total_records(&self) -> usize {
        self.containers.iter().map(|c| c.count()).sum()
    }

    pub fn skipped(&self) -> &[SkippedInput] {
        &self.skipped
    }

    /// Hands the containers out for independent consumption.
    pub fn into_containers(self) -> Vec<Box<dyn ResourceContainer>> {
        self.containers
    }
}

impl fmt::Debug for ContainerAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerAggregate")
            .field("containers", &self.containers.len())
            .field("total_records", &self.total_records())
            .field("skipped", &self.skipped)
            .finish()
    }
}

fn list_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn open_one(path: &Path) -> std::result::Result<Box<dyn ResourceContainer>, SkipReason> {
    let source = InputSource::open(path).map_err(|e| SkipReason::Io(e.to_string()))?;
    match detect(&source) {
        Format::Unknown => Err(SkipReason::UnknownFormat),
        Format::UnsupportedBundle => Err(SkipReason::UnsupportedBundle),
        format => open_container(source, format).map_err(|e| SkipReason::Io(e.to_string())),
    }
}

fn skip(path: &Path, reason: SkipReason) -> SkippedInput {
    tracing::warn!(source = %path.display(), reason = %reason, "Skipping input");
    SkippedInput {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_expansion_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        std::fs::write(
            d.join("b-patients.ndjson"),
            "{\"resourceType\":\"Patient\"}\n{\"resourceType\":\"Patient\"}\n{\"resourceType\":\"Patient\"}\n",
        )
        .unwrap();
        std::fs::write(d.join("a-obs.json"), "{\"resourceType\":\"Observation\"}").unwrap();
        std::fs::write(d.join("c-bundle.json"), "{\"resourceType\":\"Bundle\"}").unwrap();
        std::fs::write(d.join("d-notes.txt"), "free text").unwrap();
        std::fs::create_dir(d.join("nested")).unwrap();

        let agg = ContainerAggregate::open(&[d]).unwrap();
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.total_records(), 4);

        let reasons: Vec<&SkipReason> = agg.skipped().iter().map(|s| &s.reason).collect();
        assert_eq!(
            reasons,
            vec![&SkipReason::UnsupportedBundle, &SkipReason::UnknownFormat]
        );

        let formats: Vec<Format> = agg.into_containers().iter().map(|c| c.format()).collect();
        assert_eq!(formats, vec![Format::SingleResource, Format::NdJson]);
    }

    #[test]
    fn test_invalid_utf8_line_keeps_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patients.ndjson");
        let lines: [&[u8]; 4] = [
            b"{\"resourceType\":\"Patient\",\"id\":\"1\"}",
            b"{\"resourceType\":\"Patient\",\"id\":\"2\"}",
            b"{\"resourceType\":\"Patient\",\"id\":\"\xff\"}",
            b"{\"resourceType\":\"Patient\",\"id\":\"4\"}",
        ];
        let bytes = lines.join(&b'\n');
        std::fs::write(&path, bytes).unwrap();

        let agg = ContainerAggregate::open(&[&path]).unwrap();
        assert!(agg.skipped().is_empty());
        assert_eq!(agg.total_records(), 4);

        let mut container = agg.into_containers().remove(0);
        let (mut ok, mut malformed) = (0, 0);
        while let Some(record) = container.next_record() {
            match record {
                Ok(_) => ok += 1,
                Err(crate::RecordError::Malformed { line: 3, .. }) => malformed += 1,
                Err(e) => panic!("unexpected record error: {e}"),
            }
        }
        assert_eq!((ok, malformed), (3, 1));
    }

    #[test]
    fn test_missing_inputs_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("p.json");
        std::fs::write(&good, "{\"resourceType\":\"Patient\"}").unwrap();
        let missing = dir.path().join("missing.ndjson");

        let agg = ContainerAggregate::open(&[missing.clone(), good]).unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.skipped()[0].path, missing);
        assert!(matches!(agg.skipped()[0].reason, SkipReason::Io(_)));
    }

    #[test]
    fn test_no_readable_inputs_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk");
        std::fs::write(&junk, "???").unwrap();

        let err = ContainerAggregate::open(&[junk]).unwrap_err();
        assert!(matches!(err, IngestError::NoReadableInputs { count: 1 }));

        let none: [PathBuf; 0] = [];
        assert!(ContainerAggregate::open(&none).is_err());
    }
}
