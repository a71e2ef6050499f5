use std::sync::Arc;

use async_trait::async_trait;
use faultline_common::{AppResult, BulkSettings};
use faultline_core::BillingGateway;
use tracing::{info, warn};

use super::{Stores, purge_project_data};
use crate::context::{WorkItemContext, scaled_progress};
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{RemoveOrganizationWorkItem, WorkItem};

/// Removes an organization: billing, users, tokens, web hooks, projects and
/// finally the organization itself.
pub struct RemoveOrganizationHandler {
    stores: Stores,
    billing: Arc<dyn BillingGateway>,
    bulk: BulkSettings,
}

impl RemoveOrganizationHandler {
    #[must_use]
    pub fn new(stores: Stores, billing: Arc<dyn BillingGateway>, bulk: BulkSettings) -> Self {
        Self {
            stores,
            billing,
            bulk,
        }
    }

    /// Users only in this organization are deleted; the rest lose membership.
    async fn remove_users(&self, organization_id: &str) -> AppResult<(usize, usize)> {
        let users = self.stores.users.get_by_organization_id(organization_id).await?;
        let (mut removed, mut updated) = (0, 0);

        for mut user in users {
            if user.organization_ids.iter().all(|id| id == organization_id) {
                self.stores.users.remove(&user.id).await?;
                removed += 1;
            } else {
                user.organization_ids.retain(|id| id != organization_id);
                self.stores.users.save(&user).await?;
                updated += 1;
            }
        }

        Ok((removed, updated))
    }
}

#[async_trait]
impl WorkItemHandler for RemoveOrganizationHandler {
    type Payload = RemoveOrganizationWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(format!(
            "{}:{}",
            RemoveOrganizationWorkItem::TYPE,
            payload.organization_id
        ))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let organization_id = payload.organization_id.as_str();

        let Some(organization) = self.stores.organizations.get_by_id(organization_id).await?
        else {
            info!(organization_id, "Organization already removed");
            ctx.report_progress(100, Some("Organization deleted")).await;
            return Ok(());
        };

        info!(
            organization_id,
            name = %organization.name,
            requested_by = payload.current_user_id.as_deref(),
            hard_delete = payload.hard_delete,
            "Removing organization"
        );

        if let Some(customer_id) = organization.billing_customer_id.as_deref() {
            ctx.report_progress(5, Some("Canceling subscription")).await;
            self.billing.cancel_subscriptions(customer_id).await?;
        }

        ctx.check_cancelled()?;
        ctx.report_progress(10, Some("Removing users")).await;
        let (removed, updated) = self.remove_users(organization_id).await?;
        info!(organization_id, removed, updated, "Users detached");
        ctx.renew_lock().await?;

        ctx.check_cancelled()?;
        ctx.report_progress(20, Some("Removing tokens and web hooks")).await;
        let tokens = self
            .stores
            .tokens
            .remove_all_by_organization_id(organization_id)
            .await?;
        let web_hooks = self
            .stores
            .web_hooks
            .remove_all_by_organization_id(organization_id)
            .await?;
        info!(organization_id, tokens, web_hooks, "Tokens and web hooks removed");

        let projects = self
            .stores
            .projects
            .get_by_organization_id(organization_id)
            .await?;
        let project_count = projects.len() as u64;

        for (index, mut project) in projects.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let done = index as u64;
            let start = scaled_progress(done, project_count, 30, 90);
            let end = scaled_progress(done + 1, project_count, 30, 90);

            if payload.hard_delete {
                ctx.report_progress(start, Some("Removing project data")).await;
                let (events, stacks) =
                    purge_project_data(ctx, &self.stores, &self.bulk, &project.id, (start, end))
                        .await?;
                self.stores.tokens.remove_all_by_project_id(&project.id).await?;
                self.stores
                    .web_hooks
                    .remove_all_by_project_id(&project.id)
                    .await?;
                self.stores.projects.remove(&project.id).await?;
                info!(project_id = %project.id, events, stacks, "Project removed");
            } else if !project.is_deleted {
                project.is_deleted = true;
                self.stores.projects.save(&project).await?;
                ctx.report_progress(end, Some("Marking projects deleted")).await;
                info!(project_id = %project.id, "Project marked deleted");
            }

            ctx.renew_lock().await?;
        }

        if !payload.hard_delete && project_count > 0 {
            warn!(
                organization_id,
                project_count, "Projects soft-deleted; their data is left for the purge sweep"
            );
        }

        ctx.check_cancelled()?;
        ctx.report_progress(90, Some("Removing organization")).await;
        self.stores.organizations.remove(organization_id).await?;

        ctx.report_progress(100, Some("Organization deleted")).await;
        info!(organization_id, "Organization removed");
        Ok(())
    }
}
