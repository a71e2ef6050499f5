use serde::{Deserialize, Serialize};

use super::WorkItem;

/// Delete an organization and everything hanging off it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOrganizationWorkItem {
    pub organization_id: String,
    /// User who requested the removal, for audit logs.
    #[serde(default)]
    pub current_user_id: Option<String>,
    /// Cascade through projects' events and stacks. Without it projects are
    /// only soft-deleted.
    #[serde(default)]
    pub hard_delete: bool,
}

impl RemoveOrganizationWorkItem {
    #[must_use]
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            current_user_id: None,
            hard_delete: false,
        }
    }

    #[must_use]
    pub const fn hard_delete(mut self) -> Self {
        self.hard_delete = true;
        self
    }
}

impl WorkItem for RemoveOrganizationWorkItem {
    const TYPE: &'static str = "remove-organization";
}

/// Sweep over every organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMaintenanceWorkItem {
    /// Move organizations off retired plans.
    #[serde(default)]
    pub upgrade_plans: bool,
    /// Drop usage buckets past the retention horizon.
    #[serde(default)]
    pub remove_old_usage_stats: bool,
}

impl WorkItem for OrganizationMaintenanceWorkItem {
    const TYPE: &'static str = "organization-maintenance";
}
