use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use teamcloud_core::{Component, DeploymentScope, DeploymentScopeType, User};

use crate::authorize::Authorizable;
use crate::error::AdapterError;
use crate::identity::IdentityIssuer;

/// A provider integration bound to one deployment scope type.
///
/// Adapters hold no per-request state. Everything they need arrives with the
/// call (the component, the acting user) or lives in the session and token
/// stores.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn scope_type(&self) -> DeploymentScopeType;

    /// Human readable name, `Azure Resource Manager` for example.
    fn display_name(&self) -> String {
        display_name_for(self.scope_type())
    }

    /// JSON schema of the deployment scope's input data.
    fn input_data_schema(&self) -> JsonValue {
        json!({ "type": "object" })
    }

    fn input_form_schema(&self) -> JsonValue {
        json!({})
    }

    async fn is_authorized(&self, scope: &DeploymentScope) -> Result<bool, AdapterError>;

    async fn create_component(
        &self,
        component: &Component,
        user: &User,
    ) -> Result<Component, AdapterError>;

    async fn update_component(
        &self,
        component: &Component,
        user: &User,
    ) -> Result<Component, AdapterError>;

    async fn delete_component(
        &self,
        component: &Component,
        user: &User,
    ) -> Result<Component, AdapterError>;

    fn as_authorizable(&self) -> Option<&dyn Authorizable> {
        None
    }

    fn as_identity_issuer(&self) -> Option<&dyn IdentityIssuer> {
        None
    }
}

/// Split a scope type name at its inner capitals.
pub fn display_name_for(scope_type: DeploymentScopeType) -> String {
    let name = scope_type.as_str();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i > 0 && c.is_uppercase() {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
