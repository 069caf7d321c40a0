//! `geojobs-core`: shared building blocks for the geocoding engine.
//!
//! Identifiers, the domain error model and the marker traits used by the
//! domain crate. Nothing in here performs IO.

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{GeocodingJobId, OrganizationId, TenantId};
pub use value_object::ValueObject;
