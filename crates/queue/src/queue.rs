//! Queue consumer port and an in-process queue.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::{AppError, AppResult};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::jobs::WorkItemEnvelope;
use crate::retry::{DeadLetterEntry, RetryConfig};

/// A delivered work item.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub envelope: WorkItemEnvelope,
    /// Delivery number, starting at 1.
    pub attempt: u32,
}

/// Competing-consumer queue with ack/abandon semantics.
#[async_trait]
pub trait WorkItemQueue: Send + Sync {
    async fn enqueue(&self, envelope: WorkItemEnvelope) -> AppResult<()>;

    /// Wait up to `wait` for the next visible work item.
    async fn dequeue(&self, wait: Duration) -> AppResult<Option<QueueEntry>>;

    async fn ack(&self, entry: &QueueEntry) -> AppResult<()>;

    /// Return the work item for a later attempt.
    async fn abandon(&self, entry: &QueueEntry) -> AppResult<()>;

    async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> AppResult<()>;
}

struct Pending {
    envelope: WorkItemEnvelope,
    deliveries: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    in_flight: HashMap<String, u32>,
    dead_letters: Vec<DeadLetterEntry<WorkItemEnvelope>>,
    completed: Vec<String>,
}

/// Single-process queue. Abandoned items become visible again after the
/// retry backoff when one is configured.
pub struct InMemoryWorkItemQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    retry: Option<RetryConfig>,
}

impl Default for InMemoryWorkItemQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            retry: None,
        }
    }
}

impl InMemoryWorkItemQueue {
    /// Queue that redelivers abandoned items immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that delays redelivery by the retry backoff.
    #[must_use]
    pub fn with_backoff(retry: RetryConfig) -> Self {
        Self {
            retry: Some(retry),
            ..Self::default()
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry<WorkItemEnvelope>> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Ids of acknowledged work items in acknowledgement order.
    pub async fn completed(&self) -> Vec<String> {
        self.state.lock().await.completed.clone()
    }

    /// Items waiting for delivery, visible or not.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    fn take_in_flight(state: &mut QueueState, entry: &QueueEntry) -> AppResult<u32> {
        state.in_flight.remove(&entry.envelope.id).ok_or_else(|| {
            AppError::Queue(format!("work item {} is not in flight", entry.envelope.id))
        })
    }
}

#[async_trait]
impl WorkItemQueue for InMemoryWorkItemQueue {
    async fn enqueue(&self, envelope: WorkItemEnvelope) -> AppResult<()> {
        debug!(work_item_id = %envelope.id, work_item_type = %envelope.work_item_type, "Enqueued work item");
        self.state.lock().await.pending.push_back(Pending {
            envelope,
            deliveries: 0,
            visible_at: Instant::now(),
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> AppResult<Option<QueueEntry>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking so an enqueue in between
            // still wakes us.
            let notified = self.notify.notified();

            let next_visible = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(index) = state.pending.iter().position(|p| p.visible_at <= now) {
                    if let Some(pending) = state.pending.remove(index) {
                        let attempt = pending.deliveries + 1;
                        state.in_flight.insert(pending.envelope.id.clone(), attempt);
                        return Ok(Some(QueueEntry {
                            envelope: pending.envelope,
                            attempt,
                        }));
                    }
                }
                state.pending.iter().map(|p| p.visible_at).min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, entry: &QueueEntry) -> AppResult<()> {
        let mut state = self.state.lock().await;
        Self::take_in_flight(&mut state, entry)?;
        state.completed.push(entry.envelope.id.clone());
        Ok(())
    }

    async fn abandon(&self, entry: &QueueEntry) -> AppResult<()> {
        let delay = self
            .retry
            .as_ref()
            .map_or(Duration::ZERO, |r| r.delay_for_attempt(entry.attempt));

        let mut state = self.state.lock().await;
        let deliveries = Self::take_in_flight(&mut state, entry)?;
        state.pending.push_back(Pending {
            envelope: entry.envelope.clone(),
            deliveries,
            visible_at: Instant::now() + delay,
        });
        drop(state);

        debug!(work_item_id = %entry.envelope.id, delay_ms = delay.as_millis() as u64, "Work item abandoned");
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let attempts = Self::take_in_flight(&mut state, entry)?;
        warn!(work_item_id = %entry.envelope.id, attempts, reason, "Work item dead-lettered");
        state.dead_letters.push(DeadLetterEntry::new(
            entry.envelope.clone(),
            attempts,
            reason.to_string(),
        ));
        Ok(())
    }
}
