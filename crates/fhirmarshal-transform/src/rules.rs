//! Rule table model.
//!
//! A rule file is parsed once into an arena of [`RuleNode`]s. Every node has
//! a closed [`RuleKind`], so the engine dispatches on a tag instead of poking
//! at `tr/*` keys at runtime. `tr/move` paths are resolved after the whole
//! tree is built, and chains of moves are collapsed, so a move costs one
//! index lookup during a transform.
//!
//! Directive keys:
//!
//! | key            | meaning                                              |
//! |----------------|------------------------------------------------------|
//! | `tr/act`       | `"union"` or `"reference"`                           |
//! | `tr/arg`       | arguments: `type` (union), `key` (output field name) |
//! | `tr/move`      | path of segments from the table root                 |
//! | `isCollection` | keep reference lists even for one element            |
//!
//! Any other key whose value is an object is a child rule.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{Result, TransformError};

/// Index of a node in its [`RuleTable`].
pub type NodeId = usize;

/// Child rules keyed by source field name.
pub type RuleMap = HashMap<String, NodeId>;

/// One rule in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleNode {
    /// Output field name, from `tr/arg.key`.
    pub rename: Option<String>,
    pub kind: RuleKind,
}

/// What a rule does to the value it matches.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    /// Recurse into objects (and array elements) using `children`.
    Plain { children: RuleMap },
    /// Choice field: wrap the value as `{ type_name: value }`.
    Union { type_name: String },
    /// Normalize one or more `Reference` elements.
    Reference { is_collection: bool },
    /// Apply the rule found at `target`. Never points at another `Move`.
    Move { target: NodeId },
    /// A directive whose arguments could not be parsed. Reported when a
    /// resource actually hits it.
    Invalid(InvalidRule),
}

/// Why a directive could not be compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidRule {
    UnionArgs { reason: String },
    MovePath { path: String, reason: String },
}

impl InvalidRule {
    /// Turns the load-time problem into the error reported for `field`.
    pub fn to_error(&self, field: &str) -> TransformError {
        match self {
            Self::UnionArgs { reason } => TransformError::InvalidUnionArgs {
                field: field.to_string(),
                reason: reason.clone(),
            },
            Self::MovePath { path, reason } => TransformError::MalformedMove {
                field: field.to_string(),
                path: path.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// A parsed rule table for one target schema version.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    nodes: Vec<RuleNode>,
    roots: RuleMap,
}

impl RuleTable {
    /// Parses a rule table from its JSON document.
    ///
    /// The document must be an object keyed by resource or datatype name.
    /// Malformed directives do not fail the load; they become
    /// [`RuleKind::Invalid`] nodes.
    pub fn from_value(doc: &Value) -> std::result::Result<Self, String> {
        let Value::Object(root) = doc else {
            return Err(format!("expected a JSON object, found {}", kind_of(doc)));
        };

        let mut builder = Builder::default();
        let mut roots = RuleMap::with_capacity(root.len());
        for (name, rule) in root {
            if let Value::Object(rule) = rule {
                let id = builder.parse(rule);
                roots.insert(name.clone(), id);
            }
        }

        let mut table = RuleTable {
            nodes: builder.nodes,
            roots,
        };
        table.resolve_moves(builder.pending_moves);
        Ok(table)
    }

    /// Reads and parses a rule file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransformError::rule_table_load(path, e.to_string()))?;
        if text.trim().is_empty() {
            return Err(TransformError::rule_table_load(path, "file is empty"));
        }
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| TransformError::rule_table_load(path, e.to_string()))?;
        Self::from_value(&doc).map_err(|msg| TransformError::rule_table_load(path, msg))
    }

    /// Root rule for a resource or datatype name.
    pub fn root(&self, name: &str) -> Option<NodeId> {
        self.roots.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &RuleNode {
        &self.nodes[id]
    }

    /// Child rules of a root entry, when that entry is a plain structure.
    pub fn children_of(&self, name: &str) -> Option<&RuleMap> {
        match &self.node(self.root(name)?).kind {
            RuleKind::Plain { children } => Some(children),
            _ => None,
        }
    }

    /// Number of root entries.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    fn resolve_moves(&mut self, pending: Vec<(NodeId, Value)>) {
        // First pass: direct targets.
        for (id, path) in &pending {
            self.nodes[*id].kind = match self.lookup_path(path) {
                Ok(target) => RuleKind::Move { target },
                Err(reason) => RuleKind::Invalid(InvalidRule::MovePath {
                    path: path.to_string(),
                    reason,
                }),
            };
        }

        // Second pass: collapse move chains so no Move targets a Move.
        for (id, path) in &pending {
            let RuleKind::Move { target } = self.nodes[*id].kind else {
                continue;
            };
            let mut current = target;
            let mut hops = 0;
            let resolved = loop {
                match &self.nodes[current].kind {
                    RuleKind::Move { target } if hops < pending.len() => {
                        current = *target;
                        hops += 1;
                    }
                    RuleKind::Move { .. } => {
                        break RuleKind::Invalid(InvalidRule::MovePath {
                            path: path.to_string(),
                            reason: "cyclic move".to_string(),
                        });
                    }
                    RuleKind::Invalid(rule) => break RuleKind::Invalid(rule.clone()),
                    _ => break RuleKind::Move { target: current },
                }
            };
            self.nodes[*id].kind = resolved;
        }
    }

    fn lookup_path(&self, path: &Value) -> std::result::Result<NodeId, String> {
        let Value::Array(segments) = path else {
            return Err(format!("expected an array of strings, found {}", kind_of(path)));
        };
        let mut segments = segments.iter().map(|s| {
            s.as_str()
                .ok_or_else(|| format!("segment {s} is not a string"))
        });

        let first = segments
            .next()
            .ok_or_else(|| "path is empty".to_string())??;
        let mut current = self
            .root(first)
            .ok_or_else(|| format!("segment '{first}' not found"))?;

        for segment in segments {
            let segment = segment?;
            current = match &self.nodes[current].kind {
                RuleKind::Plain { children } => children
                    .get(segment)
                    .copied()
                    .ok_or_else(|| format!("segment '{segment}' not found"))?,
                _ => return Err(format!("segment '{segment}' is below a directive")),
            };
        }
        Ok(current)
    }
}

#[derive(Default)]
struct Builder {
    nodes: Vec<RuleNode>,
    pending_moves: Vec<(NodeId, Value)>,
}

impl Builder {
    fn parse(&mut self, rule: &Map<String, Value>) -> NodeId {
        let mut children = RuleMap::new();
        for (key, value) in rule {
            if key.starts_with("tr/") {
                continue;
            }
            if let Value::Object(child) = value {
                let id = self.parse(child);
                children.insert(key.clone(), id);
            }
        }

        let args = rule.get("tr/arg");
        let rename = match args.and_then(|a| a.get("key")) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(key)) => Ok(Some(key.clone())),
            Some(other) => Err(format!("key must be a string, found {}", kind_of(other))),
        };

        let action = rule.get("tr/act").and_then(Value::as_str);
        let mut pending_move = None;
        let kind = match (rename.as_ref(), rule.get("tr/move"), action) {
            (Err(reason), _, _) => RuleKind::Invalid(InvalidRule::UnionArgs {
                reason: reason.clone(),
            }),
            (_, Some(path), _) => {
                pending_move = Some(path.clone());
                RuleKind::Plain {
                    children: RuleMap::new(),
                }
            }
            (_, None, Some("union")) => match args.and_then(|a| a.get("type")) {
                Some(Value::String(t)) if !t.is_empty() => RuleKind::Union {
                    type_name: t.clone(),
                },
                Some(other) => RuleKind::Invalid(InvalidRule::UnionArgs {
                    reason: format!("type must be a non-empty string, found {other}"),
                }),
                None => RuleKind::Invalid(InvalidRule::UnionArgs {
                    reason: "missing type".to_string(),
                }),
            },
            (_, None, Some("reference")) => RuleKind::Reference {
                is_collection: matches!(rule.get("isCollection"), Some(Value::Bool(true))),
            },
            (_, None, Some(other)) => {
                tracing::warn!(action = other, "Unknown transform action, treating as structural");
                RuleKind::Plain { children }
            }
            (_, None, None) => RuleKind::Plain { children },
        };

        let id = self.nodes.len();
        self.nodes.push(RuleNode {
            rename: rename.ok().flatten(),
            kind,
        });
        if let Some(path) = pending_move {
            self.pending_moves.push((id, path));
        }
        id
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
