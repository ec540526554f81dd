//! The rule-guided rewrite of a resource tree.

use std::sync::Arc;

use fhirmarshal_core::{NormalizedReference, Resource, resource_type};
use serde_json::{Map, Value};

use crate::cache::RuleTableCache;
use crate::error::{Result, TransformError};
use crate::rules::{RuleKind, RuleMap, RuleTable};

/// Restructures resources according to the rule table of a FHIR version.
///
/// The engine holds no per-call state; clones share the same cache.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    cache: Arc<RuleTableCache>,
}

impl TransformEngine {
    pub fn new(cache: Arc<RuleTableCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<RuleTableCache> {
        &self.cache
    }

    /// Transforms `resource` with the rules for `version`.
    ///
    /// Fails when the rule table cannot be loaded, when the resource has no
    /// usable `resourceType`, or when a field hits a malformed directive.
    pub fn transform(&self, resource: &Resource, version: &str) -> Result<Resource> {
        let table = self.cache.get(version)?;
        transform_with(&table, resource)
    }
}

/// Transforms `resource` against an already loaded table.
pub fn transform_with(table: &RuleTable, resource: &Resource) -> Result<Resource> {
    let rt = resource_type(resource).map_err(TransformError::MissingResourceType)?;
    Rewriter { table }.object(resource, table.children_of(rt))
}

struct Rewriter<'a> {
    table: &'a RuleTable,
}

impl Rewriter<'_> {
    fn object(&self, source: &Map<String, Value>, rules: Option<&RuleMap>) -> Result<Resource> {
        let mut out = Map::with_capacity(source.len());
        for (key, value) in source {
            match rules.and_then(|r| r.get(key)) {
                None => {
                    out.insert(key.clone(), value.clone());
                }
                Some(&id) => {
                    let (key, value) = self.field(key, value, id)?;
                    // First writer wins when a rename lands on an existing key.
                    out.entry(key).or_insert(value);
                }
            }
        }
        Ok(out)
    }

    fn field(&self, key: &str, value: &Value, id: usize) -> Result<(String, Value)> {
        let node = self.table.node(id);
        let out_key = node.rename.clone().unwrap_or_else(|| key.to_string());

        let kind = match &node.kind {
            RuleKind::Move { target } => &self.table.node(*target).kind,
            kind => kind,
        };

        let value = match kind {
            RuleKind::Plain { children } => self.structure(value, children)?,
            RuleKind::Reference { is_collection } => references(value, *is_collection),
            RuleKind::Union { type_name } => self.union(value, type_name)?,
            RuleKind::Invalid(rule) => return Err(rule.to_error(key)),
            RuleKind::Move { .. } => {
                return Err(TransformError::MalformedMove {
                    field: key.to_string(),
                    path: String::new(),
                    reason: "unresolved move target".to_string(),
                });
            }
        };
        Ok((out_key, value))
    }

    fn structure(&self, value: &Value, children: &RuleMap) -> Result<Value> {
        match value {
            Value::Object(obj) => Ok(Value::Object(self.object(obj, Some(children))?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.structure(item, children))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Resolves a choice field to `{ <type_name>: <value> }`.
    ///
    /// The wrapper is applied in every case, not only for primitives:
    /// `Reference` values are normalized and complex types with their own
    /// sub-table are rewritten first, then wrapped. fhirbase stores choice
    /// types this way.
    fn union(&self, value: &Value, type_name: &str) -> Result<Value> {
        let inner = if type_name == "Reference" {
            references(value, false)
        } else if let Some(children) = self.table.children_of(type_name) {
            self.structure(value, children)?
        } else {
            value.clone()
        };

        let mut wrapped = Map::with_capacity(1);
        wrapped.insert(type_name.to_string(), inner);
        Ok(Value::Object(wrapped))
    }
}

/// Normalizes one reference or a list of them.
///
/// Unless `is_collection` is set, the first normalized reference is kept as a
/// single object.
fn references(value: &Value, is_collection: bool) -> Value {
    let mut normalized: Vec<Value> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| NormalizedReference::from_element(item).to_value())
            .collect(),
        Value::Null => return Value::Null,
        other => vec![NormalizedReference::from_element(other).to_value()],
    };

    if is_collection || normalized.is_empty() {
        Value::Array(normalized)
    } else {
        normalized.swap_remove(0)
    }
}
