//! The completed-export manifest.

use serde::{Deserialize, Serialize};

use crate::error::{BulkError, Result};

/// One downloadable file of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl FileListing {
    /// Staging file name: `<index>-<type>-<last url segment>.ndjson`.
    ///
    /// `index` is the listing's position in the manifest. It keeps names
    /// unique when urls differ only by query or share a last segment, and
    /// makes path order match manifest order.
    pub fn staging_name(&self, index: usize) -> String {
        let without_query = self.url.split(['?', '#']).next().unwrap_or_default();
        let last = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let segment = sanitize(last);
        let segment = if segment.is_empty() { "file".to_string() } else { segment };
        format!(
            "{index:04}-{}-{segment}.ndjson",
            sanitize(&self.resource_type)
        )
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Body of the `200` poll response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub transaction_time: Option<String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub requires_access_token: Option<bool>,
    pub output: Vec<FileListing>,
    #[serde(default)]
    pub error: Vec<FileListing>,
}

impl Manifest {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| BulkError::Manifest(e.to_string()))
    }
}
