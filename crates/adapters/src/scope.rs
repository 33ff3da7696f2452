use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use teamcloud_core::{DeploymentScope, DeploymentScopeId, OrganizationId};

use crate::error::AdapterError;

/// Lookup of deployment scopes, used to find the adapter of a component.
#[async_trait]
pub trait DeploymentScopeRepository: Send + Sync {
    async fn get(
        &self,
        organization: OrganizationId,
        id: DeploymentScopeId,
    ) -> Result<Option<DeploymentScope>, AdapterError>;

    async fn set(&self, scope: DeploymentScope) -> Result<(), AdapterError>;
}

#[async_trait]
impl<R: DeploymentScopeRepository + ?Sized> DeploymentScopeRepository for Arc<R> {
    async fn get(
        &self,
        organization: OrganizationId,
        id: DeploymentScopeId,
    ) -> Result<Option<DeploymentScope>, AdapterError> {
        (**self).get(organization, id).await
    }

    async fn set(&self, scope: DeploymentScope) -> Result<(), AdapterError> {
        (**self).set(scope).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeploymentScopes {
    scopes: RwLock<HashMap<(OrganizationId, DeploymentScopeId), DeploymentScope>>,
}

impl InMemoryDeploymentScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> AdapterError {
    AdapterError::provider("deployment scope store lock poisoned")
}

#[async_trait]
impl DeploymentScopeRepository for InMemoryDeploymentScopes {
    async fn get(
        &self,
        organization: OrganizationId,
        id: DeploymentScopeId,
    ) -> Result<Option<DeploymentScope>, AdapterError> {
        let scopes = self.scopes.read().map_err(|_| poisoned())?;
        Ok(scopes.get(&(organization, id)).cloned())
    }

    async fn set(&self, scope: DeploymentScope) -> Result<(), AdapterError> {
        let mut scopes = self.scopes.write().map_err(|_| poisoned())?;
        scopes.insert((scope.organization, scope.id), scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamcloud_core::DeploymentScopeType;

    #[tokio::test]
    async fn scopes_are_partitioned_by_organization() {
        let repo = InMemoryDeploymentScopes::new();
        let scope = DeploymentScope {
            id: DeploymentScopeId::new(),
            organization: OrganizationId::new(),
            display_name: "arm".to_string(),
            scope_type: DeploymentScopeType::AzureResourceManager,
            input_data: serde_json::Value::Null,
        };
        repo.set(scope.clone()).await.unwrap();

        assert_eq!(repo.get(scope.organization, scope.id).await.unwrap(), Some(scope.clone()));
        assert_eq!(repo.get(OrganizationId::new(), scope.id).await.unwrap(), None);
    }
}
