//! Per-invocation handler context.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use faultline_common::{AppError, AppResult, Metrics, get_metrics};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lock::LockHandle;
use crate::pubsub::{BusMessage, MessageBus};

/// Progress for `completed` of `total` units mapped into `[start, end]`.
///
/// Lets a handler compose phases, e.g. 0..90 for a copy and 90..98 for a
/// catch-up pass.
#[must_use]
pub fn scaled_progress(completed: u64, total: u64, start: u8, end: u8) -> u8 {
    if total == 0 {
        return end;
    }
    let fraction = (completed.min(total) as f64) / (total as f64);
    let span = f64::from(end.saturating_sub(start));
    (fraction * span).round() as u8 + start
}

/// Everything a handler sees while it runs: the decoded payload, the lock it
/// holds, the dispatcher's cancellation signal and a progress sink.
pub struct WorkItemContext<T> {
    work_item_id: String,
    work_item_type: &'static str,
    attempt: u32,
    data: T,
    lock: Arc<LockHandle>,
    cancel: CancellationToken,
    bus: Arc<dyn MessageBus>,
    last_progress: Mutex<Option<(u8, Option<String>)>>,
    metrics: Arc<Metrics>,
}

impl<T> WorkItemContext<T> {
    pub fn new(
        work_item_id: impl Into<String>,
        work_item_type: &'static str,
        attempt: u32,
        data: T,
        lock: Arc<LockHandle>,
        cancel: CancellationToken,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            work_item_type,
            attempt,
            data,
            lock,
            cancel,
            bus,
            last_progress: Mutex::new(None),
            metrics: Arc::clone(get_metrics()),
        }
    }

    #[must_use]
    pub const fn data(&self) -> &T {
        &self.data
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.work_item_id
    }

    /// Delivery attempt, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn lock(&self) -> &LockHandle {
        &self.lock
    }

    /// Extend the held lock. Call between bounded units of work; a
    /// [`AppError::LockLost`] must end the handler.
    pub async fn renew_lock(&self) -> AppResult<()> {
        self.lock.renew().await
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative check point.
    pub fn check_cancelled(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            debug!(work_item_id = %self.work_item_id, "Cancellation observed");
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Sleep unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> AppResult<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(AppError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Publish progress for observers. Delivery is best effort: a bus
    /// failure is logged and the handler carries on.
    pub async fn report_progress(&self, progress: u8, message: Option<&str>) {
        let progress = progress.min(100);
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Some((progress, message.map(String::from)));
        Metrics::incr(&self.metrics.progress_reports);
        debug!(
            work_item_id = %self.work_item_id,
            work_item_type = self.work_item_type,
            progress,
            message,
            "Work item progress"
        );

        let status = BusMessage::WorkItemStatus {
            work_item_id: self.work_item_id.clone(),
            work_item_type: self.work_item_type.to_string(),
            progress,
            message: message.map(String::from),
        };
        if let Err(e) = self.bus.publish(&status).await {
            warn!(work_item_id = %self.work_item_id, error = %e, "Failed to publish progress");
        }
    }

    /// The most recent progress report.
    #[must_use]
    pub fn last_progress(&self) -> Option<(u8, Option<String>)> {
        self.last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
