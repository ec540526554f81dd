//! Core types shared by every FhirMarshal crate.
//!
//! A [`Resource`] is kept as a raw JSON object: the pipeline never needs a
//! typed FHIR model, only the `resourceType` / `id` pair that identifies it
//! and the tree that the transformation engine rewrites.

pub mod error;
pub mod id;
pub mod reference;
pub mod resource;

pub use error::{CoreError, Result};
pub use id::generate_id;
pub use reference::{FhirReference, NormalizedReference, UnresolvableReference, parse_reference};
pub use resource::{Resource, into_resource, resource_id, resource_type};
