use std::collections::BTreeMap;
use std::sync::Arc;

use teamcloud_core::DeploymentScopeType;

use crate::adapter::Adapter;
use crate::error::AdapterError;

/// Adapters keyed by the deployment scope type they serve.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<DeploymentScopeType, Arc<dyn Adapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

impl AdapterRegistry {
    /// Fails if two adapters claim the same scope type.
    pub fn new<I>(adapters: I) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = Arc<dyn Adapter>>,
    {
        let mut registry = Self::default();
        for adapter in adapters {
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> Result<(), AdapterError> {
        let scope_type = adapter.scope_type();
        if self.adapters.contains_key(&scope_type) {
            return Err(AdapterError::DuplicateScopeType(scope_type));
        }
        tracing::debug!(%scope_type, adapter = %adapter.display_name(), "adapter registered");
        self.adapters.insert(scope_type, adapter);
        Ok(())
    }

    pub fn resolve(&self, scope_type: DeploymentScopeType) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&scope_type).cloned()
    }

    pub fn get(&self, scope_type: DeploymentScopeType) -> Result<Arc<dyn Adapter>, AdapterError> {
        self.resolve(scope_type)
            .ok_or(AdapterError::UnsupportedScopeType(scope_type))
    }

    pub fn scope_types(&self) -> impl Iterator<Item = DeploymentScopeType> + '_ {
        self.adapters.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use teamcloud_core::{Component, DeploymentScope, User};

    struct Stub(DeploymentScopeType);

    #[async_trait]
    impl Adapter for Stub {
        fn scope_type(&self) -> DeploymentScopeType {
            self.0
        }

        async fn is_authorized(&self, _: &DeploymentScope) -> Result<bool, AdapterError> {
            Ok(true)
        }

        async fn create_component(&self, c: &Component, _: &User) -> Result<Component, AdapterError> {
            Ok(c.clone())
        }

        async fn update_component(&self, c: &Component, _: &User) -> Result<Component, AdapterError> {
            Ok(c.clone())
        }

        async fn delete_component(&self, c: &Component, _: &User) -> Result<Component, AdapterError> {
            Ok(c.clone())
        }
    }

    #[test]
    fn resolves_by_scope_type() {
        let registry = AdapterRegistry::new([
            Arc::new(Stub(DeploymentScopeType::GitHub)) as Arc<dyn Adapter>,
            Arc::new(Stub(DeploymentScopeType::AzureDevOps)),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let github = registry.resolve(DeploymentScopeType::GitHub).unwrap();
        assert_eq!(github.scope_type(), DeploymentScopeType::GitHub);
        assert!(github.as_authorizable().is_none());
        assert!(matches!(
            registry.get(DeploymentScopeType::Kubernetes),
            Err(AdapterError::UnsupportedScopeType(DeploymentScopeType::Kubernetes))
        ));
    }

    #[test]
    fn duplicate_scope_type_is_rejected() {
        let err = AdapterRegistry::new([
            Arc::new(Stub(DeploymentScopeType::GitHub)) as Arc<dyn Adapter>,
            Arc::new(Stub(DeploymentScopeType::GitHub)),
        ])
        .unwrap_err();
        assert_eq!(err, AdapterError::DuplicateScopeType(DeploymentScopeType::GitHub));
    }
}
