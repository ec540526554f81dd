use thiserror::Error;

/// Core error types for FhirMarshal operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Missing resourceType in resource")]
    MissingResourceType,

    #[error("Invalid resourceType: expected a non-empty string, got {0}")]
    InvalidResourceType(String),

    #[error("Expected a JSON object at the resource root, got {0}")]
    NotAnObject(&'static str),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(found: impl Into<String>) -> Self {
        Self::InvalidResourceType(found.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
