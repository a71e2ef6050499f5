use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use faultline_common::{AppResult, BulkSettings};
use faultline_core::{Organization, OrganizationRepository, plans};
use tracing::{debug, info};

use super::{PageStep, for_each_page};
use crate::context::WorkItemContext;
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{OrganizationMaintenanceWorkItem, WorkItem};

/// Usage buckets older than this are dropped.
const USAGE_RETENTION_DAYS: i64 = 365;

/// Sweep over every organization, one page at a time. Runs under a single
/// global lock.
pub struct OrganizationMaintenanceHandler {
    organizations: Arc<dyn OrganizationRepository>,
    bulk: BulkSettings,
}

impl OrganizationMaintenanceHandler {
    #[must_use]
    pub fn new(organizations: Arc<dyn OrganizationRepository>, bulk: BulkSettings) -> Self {
        Self {
            organizations,
            bulk,
        }
    }
}

/// Apply the requested fixes to one organization. Returns whether it changed.
fn maintain(organization: &mut Organization, payload: &OrganizationMaintenanceWorkItem) -> bool {
    let mut changed = false;

    if payload.upgrade_plans {
        if let Some(current) = plans::replacement_for(&organization.plan_id) {
            debug!(
                organization_id = %organization.id,
                from = %organization.plan_id,
                to = current,
                "Upgrading retired plan"
            );
            organization.plan_id = current.to_string();
            changed = true;
        }
    }

    if payload.remove_old_usage_stats {
        let horizon = Utc::now() - Duration::days(USAGE_RETENTION_DAYS);
        let before = organization.usage.len();
        organization.usage.retain(|usage| usage.date >= horizon);
        changed |= organization.usage.len() != before;
    }

    if changed {
        organization.updated_at = Utc::now();
    }
    changed
}

#[async_trait]
impl WorkItemHandler for OrganizationMaintenanceHandler {
    type Payload = OrganizationMaintenanceWorkItem;

    fn lock_request(&self, _payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(OrganizationMaintenanceWorkItem::TYPE)
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let organizations = &self.organizations;

        let processed = for_each_page(ctx, &self.bulk, (0, 100), "Maintaining organizations", |page| async move {
            let result = organizations.get_all(page).await?;

            let mut changed = Vec::new();
            for mut organization in result.items.iter().cloned() {
                if maintain(&mut organization, payload) {
                    changed.push(organization);
                }
            }
            if !changed.is_empty() {
                organizations.save_all(&changed).await?;
            }

            Ok(PageStep {
                processed: result.items.len(),
                has_more: result.has_more,
                total: Some(result.total),
            })
        })
        .await?;

        info!(processed, "Organization maintenance finished");
        Ok(())
    }
}
