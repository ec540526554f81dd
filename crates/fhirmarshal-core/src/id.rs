//! Identifiers assigned to resources that arrive without an `id`.

/// Generates a fresh resource id (UUID v4, hyphenated).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
