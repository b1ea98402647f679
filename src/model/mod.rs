//! Resource model.
//!
//! This module defines the typed resources the engine reconciles: their
//! kinds, property values (including references to other resources'
//! outputs) and the per-kind schema that governs validation and change
//! policy.

mod resource;
mod schema;
mod value;

pub use resource::{Lifecycle, Resource, ResourceKind};
pub use schema::{
    ChangePolicy, DiffPolicy, KindSchema, PropertySchema, PropertyType, ReplaceTolerance,
    schema_for,
};
pub use value::{OutputRef, PlannedProperties, PlannedValue, Properties, Value};
