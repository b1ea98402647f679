//! Provider capability and implementations.
//!
//! The engine reaches remote infrastructure only through the [`Provider`]
//! trait. A [`ProviderRegistry`] maps each resource kind to its provider;
//! [`SimulatedCloud`] supplies in-memory providers for every kind.

mod capability;
mod registry;
mod simulated;

pub use capability::{Outputs, Provider, ProviderResource};
pub use registry::ProviderRegistry;
pub use simulated::{CallRecord, ProviderOp, SimulatedCloud, SimulatedObject, SimulatedProvider};

#[cfg(test)]
pub(crate) use capability::MockProvider;
