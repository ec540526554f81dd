//! Accessors for the identity fields of a raw resource.

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// A FHIR resource as read from input: a JSON object keyed by field name.
pub type Resource = Map<String, Value>;

/// Returns the `resourceType` of a resource.
///
/// Fails when the field is absent, not a string, or empty.
pub fn resource_type(resource: &Resource) -> Result<&str> {
    match resource.get("resourceType") {
        None | Some(Value::Null) => Err(CoreError::MissingResourceType),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(other) => Err(CoreError::invalid_resource_type(other.to_string())),
    }
}

/// Returns the `id` of a resource when it is a non-empty string.
pub fn resource_id(resource: &Resource) -> Option<&str> {
    resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Converts a parsed JSON value into a [`Resource`], rejecting non-objects.
pub fn into_resource(value: Value) -> Result<Resource> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(CoreError::NotAnObject("array")),
        Value::String(_) => Err(CoreError::NotAnObject("string")),
        Value::Number(_) => Err(CoreError::NotAnObject("number")),
        Value::Bool(_) => Err(CoreError::NotAnObject("boolean")),
        Value::Null => Err(CoreError::NotAnObject("null")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Resource {
        into_resource(value).unwrap()
    }

    #[test]
    fn test_resource_type_present() {
        let r = obj(json!({"resourceType": "Patient", "id": "p1"}));
        assert_eq!(resource_type(&r).unwrap(), "Patient");
        assert_eq!(resource_id(&r), Some("p1"));
    }

    #[test]
    fn test_resource_type_missing_or_invalid() {
        let r = obj(json!({"id": "p1"}));
        assert!(matches!(resource_type(&r), Err(CoreError::MissingResourceType)));

        let r = obj(json!({"resourceType": 12}));
        assert!(matches!(
            resource_type(&r),
            Err(CoreError::InvalidResourceType(_))
        ));

        let r = obj(json!({"resourceType": ""}));
        assert!(resource_type(&r).is_err());
    }

    #[test]
    fn test_empty_id_is_absent() {
        let r = obj(json!({"resourceType": "Observation", "id": ""}));
        assert_eq!(resource_id(&r), None);
    }

    #[test]
    fn test_into_resource_rejects_non_objects() {
        assert!(matches!(
            into_resource(json!([1, 2])),
            Err(CoreError::NotAnObject("array"))
        ));
    }
}
