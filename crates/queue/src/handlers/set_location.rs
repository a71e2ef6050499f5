use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_common::{AppError, AppResult};
use faultline_core::{EventRepository, GeoLookup};
use tracing::{debug, info};

use crate::context::WorkItemContext;
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{SetLocationWorkItem, WorkItem};

/// Whether an address can be resolved to a public location.
fn is_resolvable(ip_address: &str) -> bool {
    match ip_address.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            !(ip.is_loopback() || ip.is_private() || ip.is_unspecified() || ip.is_link_local())
        }
        Ok(IpAddr::V6(ip)) => !(ip.is_loopback() || ip.is_unspecified()),
        Err(_) => false,
    }
}

/// Resolves an event's client address and stores the location on the event.
pub struct SetLocationHandler {
    events: Arc<dyn EventRepository>,
    geo: Arc<dyn GeoLookup>,
}

impl SetLocationHandler {
    #[must_use]
    pub fn new(events: Arc<dyn EventRepository>, geo: Arc<dyn GeoLookup>) -> Self {
        Self { events, geo }
    }
}

#[async_trait]
impl WorkItemHandler for SetLocationHandler {
    type Payload = SetLocationWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(format!("{}:{}", SetLocationWorkItem::TYPE, payload.event_id))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let mut event = self
            .events
            .get_by_id(&payload.event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event {}", payload.event_id)))?;

        if event.location.is_some() {
            debug!(event_id = %event.id, "Location already set");
            ctx.report_progress(100, Some("Location already set")).await;
            return Ok(());
        }

        if !is_resolvable(&payload.ip_address) {
            debug!(event_id = %event.id, ip_address = %payload.ip_address, "Address not resolvable");
            ctx.report_progress(100, Some("Address not resolvable")).await;
            return Ok(());
        }

        let Some(location) = self.geo.resolve(&payload.ip_address).await? else {
            debug!(event_id = %event.id, ip_address = %payload.ip_address, "No location for address");
            ctx.report_progress(100, Some("Location unknown")).await;
            return Ok(());
        };

        info!(event_id = %event.id, country = location.country.as_deref(), "Location resolved");
        event.location = Some(location);
        self.events.save(&event).await?;
        ctx.report_progress(100, Some("Location set")).await;
        Ok(())
    }
}
