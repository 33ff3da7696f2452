//! Per-component and per-scope service identities.
//!
//! A service principal is named `{adapter type}/{combined ids}` so the same
//! component always maps to the same principal. Passwords are only handed out
//! by the directory when a principal is created or refreshed; they are kept in
//! a secret store owned by the project (component identities) or the
//! organization (scope identities).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use teamcloud_core::{combine_ids, Component, DeploymentScope};

use crate::error::AdapterError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    pub name: String,
    pub object_id: Uuid,
    pub application_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
}

impl ServicePrincipal {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|e| e <= now)
    }

    pub fn without_password(mut self) -> Self {
        self.password = None;
        self
    }
}

/// `{adapter}/{combined ids}`.
pub fn service_principal_name<I>(adapter: &str, ids: I) -> String
where
    I: IntoIterator,
    I::Item: Into<Uuid>,
{
    format!("{adapter}/{}", combine_ids(ids))
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Directories never return a password on lookup.
    async fn get_service_principal(
        &self,
        name: &str,
    ) -> Result<Option<ServicePrincipal>, AdapterError>;

    async fn create_service_principal(&self, name: &str) -> Result<ServicePrincipal, AdapterError>;

    /// Issue a new password, extending the expiry.
    async fn refresh_service_principal(
        &self,
        name: &str,
    ) -> Result<ServicePrincipal, AdapterError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn set_secret(
        &self,
        owner: Uuid,
        key: &str,
        principal: &ServicePrincipal,
    ) -> Result<(), AdapterError>;

    async fn get_secret(
        &self,
        owner: Uuid,
        key: &str,
    ) -> Result<Option<ServicePrincipal>, AdapterError>;
}

#[derive(Clone)]
pub struct ServiceIdentityManager {
    directory: Arc<dyn DirectoryService>,
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for ServiceIdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentityManager").finish_non_exhaustive()
    }
}

impl ServiceIdentityManager {
    pub fn new(directory: Arc<dyn DirectoryService>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { directory, secrets }
    }

    /// Create or refresh the principal `name`.
    ///
    /// A freshly issued password is written to `owner`'s secret store. With
    /// `with_password` an existing principal is returned with the stored
    /// password, if there is one.
    pub async fn ensure(
        &self,
        name: &str,
        owner: Uuid,
        with_password: bool,
    ) -> Result<ServicePrincipal, AdapterError> {
        let principal = match self.directory.get_service_principal(name).await? {
            None => {
                info!(principal = %name, "creating service principal");
                self.directory.create_service_principal(name).await?
            }
            Some(existing) if existing.is_expired_at(Utc::now()) => {
                info!(principal = %name, "refreshing expired service principal");
                self.directory.refresh_service_principal(name).await?
            }
            Some(existing) => existing,
        };

        if principal.password.is_some() {
            self.secrets.set_secret(owner, name, &principal).await?;
            return Ok(principal);
        }

        if with_password {
            if let Some(stored) = self.secrets.get_secret(owner, name).await? {
                return Ok(stored);
            }
            debug!(principal = %name, "no stored password for service principal");
        }
        Ok(principal)
    }
}

/// Capability of adapters that run work under a dedicated identity.
#[async_trait]
pub trait IdentityIssuer: Send + Sync {
    /// Type name the principal names are prefixed with.
    fn identity_prefix(&self) -> &str;

    fn identities(&self) -> &ServiceIdentityManager;

    async fn component_identity(
        &self,
        component: &Component,
        with_password: bool,
    ) -> Result<ServicePrincipal, AdapterError> {
        let name = service_principal_name(
            self.identity_prefix(),
            [
                *component.organization.as_uuid(),
                *component.deployment_scope.as_uuid(),
                *component.project.as_uuid(),
            ],
        );
        self.identities()
            .ensure(&name, *component.project.as_uuid(), with_password)
            .await
    }

    async fn scope_identity(
        &self,
        scope: &DeploymentScope,
        with_password: bool,
    ) -> Result<ServicePrincipal, AdapterError> {
        let name = service_principal_name(
            self.identity_prefix(),
            [*scope.organization.as_uuid(), *scope.id.as_uuid()],
        );
        self.identities()
            .ensure(&name, *scope.organization.as_uuid(), with_password)
            .await
    }
}

/// Directory double that issues random passwords valid for a year.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    principals: RwLock<HashMap<String, ServicePrincipal>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move the expiry of `name`, if it exists.
    pub fn set_expiry(&self, name: &str, expires_on: DateTime<Utc>) -> Result<(), AdapterError> {
        let mut principals = self.principals.write().map_err(|_| poisoned())?;
        if let Some(p) = principals.get_mut(name) {
            p.expires_on = Some(expires_on);
        }
        Ok(())
    }

    fn issue(&self, name: &str, object_id: Uuid, application_id: Uuid) -> ServicePrincipal {
        ServicePrincipal {
            name: name.to_string(),
            object_id,
            application_id,
            password: Some(Uuid::new_v4().simple().to_string()),
            expires_on: Some(Utc::now() + Duration::days(365)),
        }
    }
}

fn poisoned() -> AdapterError {
    AdapterError::Directory("lock poisoned".to_string())
}

#[async_trait]
impl DirectoryService for InMemoryDirectory {
    async fn get_service_principal(
        &self,
        name: &str,
    ) -> Result<Option<ServicePrincipal>, AdapterError> {
        let principals = self.principals.read().map_err(|_| poisoned())?;
        Ok(principals.get(name).cloned().map(ServicePrincipal::without_password))
    }

    async fn create_service_principal(&self, name: &str) -> Result<ServicePrincipal, AdapterError> {
        let mut principals = self.principals.write().map_err(|_| poisoned())?;
        if principals.contains_key(name) {
            return Err(AdapterError::Directory(format!(
                "service principal {name} already exists"
            )));
        }
        let principal = self.issue(name, Uuid::new_v4(), Uuid::new_v4());
        principals.insert(name.to_string(), principal.clone());
        Ok(principal)
    }

    async fn refresh_service_principal(
        &self,
        name: &str,
    ) -> Result<ServicePrincipal, AdapterError> {
        let mut principals = self.principals.write().map_err(|_| poisoned())?;
        let existing = principals
            .get(name)
            .ok_or_else(|| AdapterError::Directory(format!("service principal {name} not found")))?;
        let principal = self.issue(name, existing.object_id, existing.application_id);
        principals.insert(name.to_string(), principal.clone());
        Ok(principal)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<(Uuid, String), ServicePrincipal>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn set_secret(
        &self,
        owner: Uuid,
        key: &str,
        principal: &ServicePrincipal,
    ) -> Result<(), AdapterError> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| AdapterError::Secrets("lock poisoned".to_string()))?;
        secrets.insert((owner, key.to_string()), principal.clone());
        Ok(())
    }

    async fn get_secret(
        &self,
        owner: Uuid,
        key: &str,
    ) -> Result<Option<ServicePrincipal>, AdapterError> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| AdapterError::Secrets("lock poisoned".to_string()))?;
        Ok(secrets.get(&(owner, key.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamcloud_core::{ComponentId, DeploymentScopeId, OrganizationId, ProjectId, ResourceState};

    struct Issuer {
        identities: ServiceIdentityManager,
    }

    impl IdentityIssuer for Issuer {
        fn identity_prefix(&self) -> &str {
            "AzureResourceManagerAdapter"
        }

        fn identities(&self) -> &ServiceIdentityManager {
            &self.identities
        }
    }

    fn component() -> Component {
        Component {
            id: ComponentId::new(),
            organization: OrganizationId::new(),
            project: ProjectId::new(),
            deployment_scope: DeploymentScopeId::new(),
            display_name: "web".to_string(),
            resource_id: None,
            resource_state: ResourceState::Pending,
        }
    }

    fn issuer() -> (Issuer, Arc<InMemoryDirectory>, Arc<InMemorySecretStore>) {
        let directory = InMemoryDirectory::arc();
        let secrets = InMemorySecretStore::arc();
        let issuer = Issuer {
            identities: ServiceIdentityManager::new(directory.clone(), secrets.clone()),
        };
        (issuer, directory, secrets)
    }

    #[test]
    fn principal_name_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            service_principal_name("X", [a, b]),
            service_principal_name("X", [b, a])
        );
        assert!(service_principal_name("X", [a]).starts_with("X/"));
    }

    #[tokio::test]
    async fn first_call_creates_and_stores_password() {
        let (issuer, _, secrets) = issuer();
        let component = component();

        let created = issuer.component_identity(&component, false).await.unwrap();
        assert!(created.password.is_some());

        let stored = secrets
            .get_secret(*component.project.as_uuid(), &created.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.password, created.password);
    }

    #[tokio::test]
    async fn existing_identity_reads_password_only_when_asked() {
        let (issuer, _, _) = issuer();
        let component = component();
        let created = issuer.component_identity(&component, false).await.unwrap();

        let bare = issuer.component_identity(&component, false).await.unwrap();
        assert_eq!(bare.object_id, created.object_id);
        assert_eq!(bare.password, None);

        let full = issuer.component_identity(&component, true).await.unwrap();
        assert_eq!(full.password, created.password);
    }

    #[tokio::test]
    async fn expired_identity_is_refreshed() {
        let (issuer, directory, _) = issuer();
        let component = component();
        let created = issuer.component_identity(&component, false).await.unwrap();
        directory
            .set_expiry(&created.name, Utc::now() - Duration::minutes(1))
            .unwrap();

        let refreshed = issuer.component_identity(&component, false).await.unwrap();
        assert_eq!(refreshed.object_id, created.object_id);
        assert!(refreshed.password.is_some());
        assert_ne!(refreshed.password, created.password);
    }
}
