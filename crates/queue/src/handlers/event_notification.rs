use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::{AppError, AppResult, Metrics, get_metrics};
use faultline_core::{FormattingPipeline, MailMessage, MailSender, NotificationContext};
use tracing::{debug, info};

use super::Stores;
use crate::cache::CacheClient;
use crate::context::{WorkItemContext, scaled_progress};
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{EventNotificationWorkItem, WorkItem};

/// How long a delivered notification is remembered.
const SENT_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn sent_marker(event_id: &str, user_id: &str) -> String {
    format!("notification-sent:{event_id}:{user_id}")
}

/// Mails an event occurrence to every opted-in user of the owning
/// organization. Each recipient gets the message at most once, even when the
/// work item is redelivered after a partial run.
pub struct EventNotificationHandler {
    stores: Stores,
    mail: Arc<dyn MailSender>,
    cache: Arc<dyn CacheClient>,
    formatting: FormattingPipeline,
}

impl EventNotificationHandler {
    #[must_use]
    pub fn new(
        stores: Stores,
        mail: Arc<dyn MailSender>,
        cache: Arc<dyn CacheClient>,
        formatting: FormattingPipeline,
    ) -> Self {
        Self {
            stores,
            mail,
            cache,
            formatting,
        }
    }
}

#[async_trait]
impl WorkItemHandler for EventNotificationHandler {
    type Payload = EventNotificationWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(format!(
            "{}:{}",
            EventNotificationWorkItem::TYPE,
            payload.event_id
        ))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let event = self
            .stores
            .events
            .get_by_id(&payload.event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event {}", payload.event_id)))?;
        let project = self
            .stores
            .projects
            .get_by_id(&event.project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {}", event.project_id)))?;
        let organization = self
            .stores
            .organizations
            .get_by_id(&event.organization_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("organization {}", event.organization_id))
            })?;

        let recipients: Vec<_> = self
            .stores
            .users
            .get_by_organization_id(&organization.id)
            .await?
            .into_iter()
            .filter(|u| u.email_notifications_enabled && !u.email_address.is_empty())
            .collect();
        if recipients.is_empty() {
            debug!(event_id = %event.id, "No users want notifications");
            ctx.report_progress(100, Some("No recipients")).await;
            return Ok(());
        }

        let message = self.formatting.notification_message(&NotificationContext {
            event: &event,
            project_name: &project.name,
            is_new: payload.is_new,
            is_regression: payload.is_regression,
            total_occurrences: payload.total_occurrences,
        });

        let metrics = get_metrics();
        let total = recipients.len() as u64;
        let mut sent = 0u64;
        for (index, user) in recipients.iter().enumerate() {
            ctx.check_cancelled()?;

            let marker = sent_marker(&event.id, &user.id);
            if self.cache.get(&marker).await?.is_some() {
                debug!(event_id = %event.id, user_id = %user.id, "Notification already sent");
            } else {
                self.mail
                    .send(&MailMessage {
                        to: user.email_address.clone(),
                        subject: message.subject.clone(),
                        body: message.body.clone(),
                    })
                    .await?;
                self.cache.set_if_absent(&marker, "1", SENT_MARKER_TTL).await?;
                Metrics::incr(&metrics.mails_sent);
                sent += 1;
            }

            ctx.report_progress(
                scaled_progress(index as u64 + 1, total, 0, 100),
                Some("Sending notifications"),
            )
            .await;
        }

        info!(event_id = %event.id, recipients = total, sent, "Event notification delivered");
        Ok(())
    }
}
