//! Schema-driven transformation of FHIR resources.
//!
//! A rule table (one JSON document per target schema version) describes how
//! each resource type should be restructured before it is stored:
//!
//! ```json
//! {
//!   "Observation": {
//!     "subject": { "tr/act": "reference" },
//!     "valueQuantity": { "tr/act": "union", "tr/arg": { "type": "Quantity", "key": "value" } },
//!     "code": { "tr/move": ["CodeableConcept"] }
//!   },
//!   "Quantity": { "value": {} },
//!   "CodeableConcept": { "coding": {} }
//! }
//! ```
//!
//! Fields without a rule pass through untouched. The table is parsed into a
//! closed [`RuleKind`] tree with `tr/move` targets resolved up front, and is
//! cached per version by [`RuleTableCache`].
//!
//! # Modules
//!
//! - [`rules`]: rule node model and table parsing
//! - [`cache`]: load-once, per-version rule table cache
//! - [`engine`]: the recursive rewrite

pub mod cache;
pub mod engine;
pub mod error;
pub mod rules;

pub use cache::RuleTableCache;
pub use engine::{TransformEngine, transform_with};
pub use error::{Result, TransformError};
pub use rules::{InvalidRule, NodeId, RuleKind, RuleMap, RuleNode, RuleTable};
