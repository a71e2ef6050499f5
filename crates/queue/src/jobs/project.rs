use serde::{Deserialize, Serialize};

use super::WorkItem;

/// Delete a project's data, and the project itself unless `reset` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveProjectWorkItem {
    pub project_id: String,
    #[serde(default)]
    pub reset: bool,
}

impl RemoveProjectWorkItem {
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            reset: false,
        }
    }

    /// Keep the project, only wipe its events and stacks.
    #[must_use]
    pub fn reset(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            reset: true,
        }
    }
}

impl WorkItem for RemoveProjectWorkItem {
    const TYPE: &'static str = "remove-project";
}
