//! Error types for the transformation engine.

use std::path::PathBuf;

use fhirmarshal_core::CoreError;

/// Errors raised while loading rule tables or transforming a resource.
///
/// None of these are retried; the caller decides whether to skip the record
/// or abort the run.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// No rule file exists for the requested version.
    #[error("No transformation rules for FHIR version {version} (looked for {})", path.display())]
    MissingRuleTable { version: String, path: PathBuf },

    /// The rule file exists but cannot be read or parsed.
    #[error("Cannot load transformation file {}: {message}", path.display())]
    RuleTableLoad { path: PathBuf, message: String },

    /// The resource has no usable `resourceType`.
    #[error("Cannot determine resourceType: {0}")]
    MissingResourceType(#[source] CoreError),

    /// A `union` directive has a missing or non-string `type`, or a non-string `key`.
    #[error("Invalid union arguments for field '{field}': {reason}")]
    InvalidUnionArgs { field: String, reason: String },

    /// A `tr/move` path is not an array of strings or does not resolve.
    #[error("Malformed move path {path} for field '{field}': {reason}")]
    MalformedMove {
        field: String,
        path: String,
        reason: String,
    },
}

impl TransformError {
    /// Creates a `MissingRuleTable` error.
    #[must_use]
    pub fn missing_rule_table(version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingRuleTable {
            version: version.into(),
            path: path.into(),
        }
    }

    /// Creates a `RuleTableLoad` error.
    #[must_use]
    pub fn rule_table_load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::RuleTableLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error concerns the rule table rather than one record.
    ///
    /// Rule-table errors affect every record of a run.
    #[must_use]
    pub fn is_rule_table_error(&self) -> bool {
        matches!(
            self,
            Self::MissingRuleTable { .. } | Self::RuleTableLoad { .. }
        )
    }
}

/// Result type alias for transformation operations.
pub type Result<T> = std::result::Result<T, TransformError>;
