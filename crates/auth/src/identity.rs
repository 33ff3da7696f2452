use serde::{Deserialize, Serialize};
use uuid::Uuid;

use teamcloud_core::{combine_ids, DeploymentScopeId, OrganizationId};

/// Key of an authorization session or token.
///
/// The row key is the XOR merge of organization and deployment scope, so it is
/// deterministic and independent of argument order. The partition is the
/// adapter's type name, which keeps identities unique per adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationIdentity {
    pub adapter: String,
    pub organization: OrganizationId,
    pub deployment_scope: DeploymentScopeId,
}

impl AuthorizationIdentity {
    pub fn new(
        adapter: impl Into<String>,
        organization: OrganizationId,
        deployment_scope: DeploymentScopeId,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            organization,
            deployment_scope,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.adapter
    }

    pub fn row_key(&self) -> Uuid {
        combine_ids([*self.organization.as_uuid(), *self.deployment_scope.as_uuid()])
    }
}
