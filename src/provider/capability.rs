//! Provider capability trait.
//!
//! A provider performs the remote create/update/delete calls for one
//! resource kind. The engine treats it as opaque: calls may be slow, may
//! fail, and are only retried when the provider declares them idempotent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::model::{DiffPolicy, PlannedProperties, Properties, ResourceKind, schema_for};

/// Output values reported by a provider (e.g. `id`, `address`).
pub type Outputs = BTreeMap<String, String>;

/// A remote object returned by [`Provider::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Outputs other resources may reference.
    pub outputs: Outputs,
}

/// Typed CRUD capability for one resource kind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// The kind this provider manages.
    fn kind(&self) -> ResourceKind;

    /// Whether repeating a failed call is safe.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Decides how a change from `old` to `new` must be applied.
    ///
    /// The default follows the kind's schema.
    fn diff_policy(&self, old: &Properties, new: &PlannedProperties) -> DiffPolicy {
        schema_for(self.kind()).diff_policy(old, new)
    }

    /// Creates a remote object.
    async fn create(
        &self,
        name: &str,
        properties: &Properties,
    ) -> Result<ProviderResource, ProviderError>;

    /// Updates a remote object in place and returns its new outputs.
    async fn update(
        &self,
        provider_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError>;

    /// Deletes a remote object.
    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;
}
