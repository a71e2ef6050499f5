use async_trait::async_trait;
use faultline_common::{AppResult, BulkSettings};
use tracing::info;

use super::{Stores, purge_project_data};
use crate::context::WorkItemContext;
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{RemoveProjectWorkItem, WorkItem};

/// Removes a project's events and stacks, then the project unless resetting.
pub struct RemoveProjectHandler {
    stores: Stores,
    bulk: BulkSettings,
}

impl RemoveProjectHandler {
    #[must_use]
    pub const fn new(stores: Stores, bulk: BulkSettings) -> Self {
        Self { stores, bulk }
    }
}

#[async_trait]
impl WorkItemHandler for RemoveProjectHandler {
    type Payload = RemoveProjectWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(format!(
            "{}:{}",
            RemoveProjectWorkItem::TYPE,
            payload.project_id
        ))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let project_id = payload.project_id.as_str();
        let done_message = if payload.reset {
            "Project data reset"
        } else {
            "Project deleted"
        };

        let Some(project) = self.stores.projects.get_by_id(project_id).await? else {
            info!(project_id, "Project already removed");
            ctx.report_progress(100, Some(done_message)).await;
            return Ok(());
        };

        info!(project_id, name = %project.name, reset = payload.reset, "Removing project data");
        let (events, stacks) =
            purge_project_data(ctx, &self.stores, &self.bulk, project_id, (0, 90)).await?;

        ctx.check_cancelled()?;
        if !payload.reset {
            ctx.report_progress(90, Some("Removing tokens and web hooks"))
                .await;
            self.stores.tokens.remove_all_by_project_id(project_id).await?;
            self.stores
                .web_hooks
                .remove_all_by_project_id(project_id)
                .await?;
            self.stores.projects.remove(project_id).await?;
        }

        ctx.report_progress(100, Some(done_message)).await;
        info!(project_id, events, stacks, reset = payload.reset, "Project data removed");
        Ok(())
    }
}
