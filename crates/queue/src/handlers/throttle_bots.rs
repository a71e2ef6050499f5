use std::sync::Arc;

use async_trait::async_trait;
use faultline_common::{AppResult, BulkSettings};
use faultline_core::EventRepository;
use tracing::info;

use super::{PageStep, for_each_page};
use crate::context::WorkItemContext;
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{ThrottleBotsWorkItem, WorkItem};

/// Hides every visible event one client address sent inside a window.
///
/// Runs under the throttling lock so a flood of reports for the same
/// organization only triggers a bounded number of sweeps per period.
pub struct ThrottleBotsHandler {
    events: Arc<dyn EventRepository>,
    bulk: BulkSettings,
}

impl ThrottleBotsHandler {
    #[must_use]
    pub fn new(events: Arc<dyn EventRepository>, bulk: BulkSettings) -> Self {
        Self { events, bulk }
    }
}

#[async_trait]
impl WorkItemHandler for ThrottleBotsHandler {
    type Payload = ThrottleBotsWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::throttled(format!(
            "{}:{}",
            ThrottleBotsWorkItem::TYPE,
            payload.organization_id
        ))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let events = &self.events;

        let hidden = for_each_page(ctx, &self.bulk, (0, 100), "Hiding events", |page| async move {
            // Hidden events drop out of the query, so always read the head.
            let batch = events
                .get_visible_by_client_ip(
                    &payload.organization_id,
                    &payload.client_ip_address,
                    payload.utc_start,
                    payload.utc_end,
                    page.limit,
                )
                .await?;
            let ids: Vec<String> = batch.into_iter().map(|e| e.id).collect();
            let hidden = if ids.is_empty() {
                0
            } else {
                events.hide(&ids).await?
            };
            Ok(PageStep {
                processed: hidden as usize,
                has_more: ids.len() == page.limit,
                total: None,
            })
        })
        .await?;

        info!(
            organization_id = %payload.organization_id,
            client_ip_address = %payload.client_ip_address,
            hidden,
            "Bot events hidden"
        );
        Ok(())
    }
}
