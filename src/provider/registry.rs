//! Lookup of providers by resource kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PlanError;
use crate::model::ResourceKind;

use super::capability::Provider;

/// Maps each resource kind to the provider that manages it.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under the kind it reports, replacing any
    /// previous one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Registers a provider, builder style.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Returns the provider for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::MissingProvider`] if none is registered.
    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn Provider>, PlanError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| PlanError::MissingProvider {
                kind: kind.to_string(),
            })
    }

    /// Kinds with a registered provider.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn test_lookup_by_kind() {
        let mut mock = MockProvider::new();
        mock.expect_kind().return_const(ResourceKind::Network);

        let registry = ProviderRegistry::new().with(Arc::new(mock));

        assert!(registry.get(ResourceKind::Network).is_ok());
        assert!(matches!(
            registry.get(ResourceKind::Disk),
            Err(PlanError::MissingProvider { ref kind }) if kind == "disk"
        ));
        assert_eq!(registry.kinds(), vec![ResourceKind::Network]);
    }
}
