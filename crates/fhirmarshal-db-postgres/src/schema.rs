//! Table routing and row shape.
//!
//! Storage uses one table per resource type, named after the lowercased
//! type:
//!
//! ```sql
//! CREATE TABLE "patient" (
//!     id            TEXT PRIMARY KEY,
//!     txid          BIGINT NOT NULL,
//!     resource_type TEXT,
//!     status        TEXT NOT NULL,
//!     resource      JSONB NOT NULL
//! );
//! ```
//!
//! The schema itself is created outside the loader.

use fhirmarshal_core::{Resource, resource_type};
use serde_json::Value;

use crate::error::RowError;

/// Column list shared by both write strategies.
pub const COLUMNS: &str = "id, txid, resource_type, status, resource";

/// Status written for every loaded row.
pub const STATUS_CREATED: &str = "created";

/// Converts a FHIR resource type to a table name.
///
/// Table names are always lowercase. Only ASCII alphanumerics are accepted,
/// since the name is spliced into SQL.
pub fn table_name(resource_type: &str) -> Result<String, RowError> {
    let valid = resource_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(RowError::InvalidTableName(resource_type.to_string()));
    }
    Ok(resource_type.to_lowercase())
}

/// One row ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRow {
    /// `None` when the resource carries no id; the writer assigns one.
    pub id: Option<String>,
    pub resource_type: String,
    pub table: String,
    pub resource: Value,
}

impl StorageRow {
    /// Routes a transformed resource to its table.
    pub fn from_resource(resource: Resource) -> Result<Self, RowError> {
        let rt = resource_type(&resource)
            .map_err(|e| RowError::MissingResourceType(e.to_string()))?
            .to_string();
        let table = table_name(&rt)?;

        let id = match resource.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => return Err(RowError::InvalidId(other.to_string())),
        };

        Ok(Self {
            id,
            resource_type: rt,
            table,
            resource: Value::Object(resource),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirmarshal_core::into_resource;
    use serde_json::json;

    fn row(value: Value) -> Result<StorageRow, RowError> {
        StorageRow::from_resource(into_resource(value).unwrap())
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("Patient").unwrap(), "patient");
        assert_eq!(table_name("MedicationRequest").unwrap(), "medicationrequest");
        assert!(table_name("").is_err());
        assert!(table_name("Patient\"; DROP TABLE x; --").is_err());
        assert!(table_name("1Patient").is_err());
    }

    #[test]
    fn test_row_from_resource() {
        let r = row(json!({"resourceType": "Observation", "id": "o1", "status": "final"})).unwrap();
        assert_eq!(r.table, "observation");
        assert_eq!(r.resource_type, "Observation");
        assert_eq!(r.id.as_deref(), Some("o1"));
        assert_eq!(r.resource["status"], "final");

        let r = row(json!({"resourceType": "Observation"})).unwrap();
        assert_eq!(r.id, None);
    }

    #[test]
    fn test_unroutable_records() {
        assert!(matches!(
            row(json!({"id": "x"})),
            Err(RowError::MissingResourceType(_))
        ));
        assert!(matches!(
            row(json!({"resourceType": "Bad-Type"})),
            Err(RowError::InvalidTableName(_))
        ));
        assert!(matches!(
            row(json!({"resourceType": "Patient", "id": 7})),
            Err(RowError::InvalidId(_))
        ));
    }
}
