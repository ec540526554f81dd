//! FHIR Reference parsing and normalization.
//!
//! Storage keeps references in a flattened shape:
//!
//! ```json
//! { "id": "123", "resourceType": "Patient", "display": "John Smith" }
//! ```
//!
//! The source element is a FHIR `Reference` datatype. Its `reference` string
//! (`Patient/123`, `Patient/123/_history/2`, or an absolute URL ending in
//! `Type/id`) is preferred; when it is missing or unusable, a `display` that
//! itself looks like `Type/id` is used instead. Anything else yields a
//! display-only reference.
//!
//! # Example
//!
//! ```
//! use fhirmarshal_core::reference::NormalizedReference;
//! use serde_json::json;
//!
//! let r = NormalizedReference::from_element(&json!({"reference": "Patient/123"}));
//! assert_eq!(r.id.as_deref(), Some("123"));
//! assert_eq!(r.resource_type.as_deref(), Some("Patient"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
    /// Optional version ID from `_history` suffix
    pub version: Option<String>,
}

/// Represents a reference string that does not carry a `Type/id` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A URN reference (`urn:uuid:xxx` or `urn:oid:xxx`)
    Urn(String),
    /// A malformed or invalid reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a reference string into its `Type/id` components.
///
/// Relative (`Patient/123`), versioned (`Patient/123/_history/2`) and
/// absolute (`https://host/fhir/Patient/123`) forms are accepted; the
/// trailing `Type/id` pair is taken in each case.
pub fn parse_reference(reference: &str) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "empty reference".to_string(),
        ));
    }

    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }

    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    // Drop scheme and authority of absolute URLs; only the path matters.
    let path = match reference.find("://") {
        Some(pos) => {
            let rest = &reference[pos + 3..];
            rest.find('/').map(|slash| &rest[slash + 1..]).unwrap_or("")
        }
        None => reference,
    };

    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

    let (resource_type, id, version) =
        if parts.len() >= 4 && parts[parts.len() - 2] == "_history" {
            let n = parts.len();
            (parts[n - 4], parts[n - 3], Some(parts[n - 1].to_string()))
        } else if parts.len() >= 2 {
            let n = parts.len();
            (parts[n - 2], parts[n - 1], None)
        } else {
            return Err(UnresolvableReference::Invalid(format!(
                "reference must contain at least Type/id: {reference}"
            )));
        };

    if !is_resource_type_name(resource_type) {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must be an alphanumeric name starting with an uppercase letter: {resource_type}"
        )));
    }

    if !is_resource_id(id) {
        return Err(UnresolvableReference::Invalid(format!(
            "invalid resource id: {id}"
        )));
    }

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        version,
    })
}

fn is_resource_type_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase()) && chars.all(|c| c.is_ascii_alphanumeric())
}

fn is_resource_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// The storage form of a reference element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl NormalizedReference {
    /// Normalizes one `Reference` element.
    pub fn from_element(element: &Value) -> Self {
        let reference = element
            .get("reference")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty());
        let display = element
            .get("display")
            .and_then(Value::as_str)
            .map(str::to_string);

        let parsed = reference
            .and_then(|r| parse_reference(r).ok())
            .or_else(|| display.as_deref().and_then(|d| parse_reference(d).ok()));

        match parsed {
            Some(r) => Self {
                id: Some(r.id),
                resource_type: Some(r.resource_type),
                display,
            },
            None => Self {
                id: None,
                resource_type: None,
                display,
            },
        }
    }

    /// Renders the normalized reference as a JSON object.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        if let Some(rt) = &self.resource_type {
            map.insert("resourceType".to_string(), Value::String(rt.clone()));
        }
        if let Some(display) = &self.display {
            map.insert("display".to_string(), Value::String(display.clone()));
        }
        Value::Object(map)
    }
}
