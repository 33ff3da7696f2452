//! Provisioning state of external resources.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an externally provisioned resource (component, task run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceState {
    #[default]
    Pending,
    Initializing,
    Provisioning,
    Succeeded,
    Failed,
}

impl ResourceState {
    /// Returns true once the resource will not change state on its own.
    pub fn is_final(&self) -> bool {
        matches!(self, ResourceState::Succeeded | ResourceState::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_final()
    }
}

impl core::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ResourceState::Pending => "Pending",
            ResourceState::Initializing => "Initializing",
            ResourceState::Provisioning => "Provisioning",
            ResourceState::Succeeded => "Succeeded",
            ResourceState::Failed => "Failed",
        };
        f.write_str(s)
    }
}
