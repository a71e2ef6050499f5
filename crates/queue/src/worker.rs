//! Redis-backed work item transport.
//!
//! Producers push [`WorkItemEnvelope`]s into an apalis Redis storage; the
//! worker function hands each delivery to the [`WorkItemDispatcher`] and maps
//! its disposition onto apalis' retry semantics.
//!
//! Transient abandons (busy or lost locks, cancellation) bypass the apalis
//! retry layer: the envelope goes back into storage after the backoff, or at
//! once when the process is shutting down, and starts a fresh attempt count.

#![allow(missing_docs)]

use std::sync::Arc;

use apalis::prelude::*;
use apalis_redis::RedisStorage;
use async_trait::async_trait;
use faultline_common::{AppError, AppResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Disposition, WorkItemDispatcher};
use crate::jobs::{WorkItem, WorkItemEnvelope};
use crate::queue::{InMemoryWorkItemQueue, WorkItemQueue};

/// Puts a work item back into the queue as a new delivery.
#[async_trait]
pub trait Redeliver: Send + Sync {
    async fn redeliver(&self, envelope: WorkItemEnvelope) -> AppResult<()>;
}

/// Context for the work item worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub dispatcher: Arc<WorkItemDispatcher>,
    /// Cancelled on process shutdown; handlers see a child token.
    pub shutdown: CancellationToken,
    /// Where transient abandons are sent back to.
    pub redeliver: Arc<dyn Redeliver>,
}

fn boxed(reason: String) -> Arc<BoxDynError> {
    Arc::new(Box::<dyn std::error::Error + Send + Sync>::from(reason))
}

/// Worker function for work items.
///
/// `Abandon` becomes a retryable failure, `DeadLetter` aborts the job so the
/// retry layer leaves it alone.
///
/// # Errors
/// Returns an error when the dispatcher did not acknowledge the work item.
pub async fn work_item_worker(
    envelope: WorkItemEnvelope,
    ctx: Data<WorkerContext>,
    attempt: Attempt,
) -> Result<(), Error> {
    // apalis counts from zero.
    let attempt = u32::try_from(attempt.current()).unwrap_or(u32::MAX).saturating_add(1);
    deliver(&ctx, envelope, attempt).await
}

/// Process one delivery and settle it the way apalis expects.
pub async fn deliver(
    ctx: &WorkerContext,
    envelope: WorkItemEnvelope,
    attempt: u32,
) -> Result<(), Error> {
    match ctx
        .dispatcher
        .process(&envelope, attempt, ctx.shutdown.child_token())
        .await
    {
        Disposition::Ack => Ok(()),
        Disposition::Abandon {
            transient: true, ..
        } => redeliver_later(ctx, envelope, attempt).await,
        Disposition::Abandon { reason, .. } => Err(Error::Failed(boxed(reason))),
        Disposition::DeadLetter { reason } => Err(Error::Abort(boxed(reason))),
    }
}

async fn redeliver_later(
    ctx: &WorkerContext,
    envelope: WorkItemEnvelope,
    attempt: u32,
) -> Result<(), Error> {
    if !ctx.shutdown.is_cancelled() {
        let delay = ctx.dispatcher.retry().delay_for_attempt(attempt);
        debug!(work_item_id = %envelope.id, delay_ms = delay.as_millis() as u64, "Backing off before redelivery");
        tokio::select! {
            () = ctx.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    let id = envelope.id.clone();
    match ctx.redeliver.redeliver(envelope).await {
        Ok(()) => {
            info!(work_item_id = %id, "Work item handed back for redelivery");
            Ok(())
        }
        Err(e) => {
            warn!(work_item_id = %id, error = %e, "Failed to hand work item back");
            Err(Error::Failed(boxed(e.to_string())))
        }
    }
}

/// Enqueues work items into Redis for the worker fleet.
#[derive(Clone)]
pub struct RedisWorkItemProducer {
    storage: RedisStorage<WorkItemEnvelope>,
}

impl RedisWorkItemProducer {
    #[must_use]
    pub const fn new(storage: RedisStorage<WorkItemEnvelope>) -> Self {
        Self { storage }
    }

    /// Queue a work item. Returns the envelope id.
    pub async fn enqueue<T: WorkItem>(&self, payload: &T) -> AppResult<String> {
        let envelope = WorkItemEnvelope::new(payload)?;
        let id = envelope.id.clone();

        self.storage
            .clone()
            .push(envelope)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to queue work item: {e}")))?;

        debug!(work_item_id = %id, work_item_type = T::TYPE, "Queued work item");
        Ok(id)
    }
}

#[async_trait]
impl Redeliver for RedisWorkItemProducer {
    async fn redeliver(&self, envelope: WorkItemEnvelope) -> AppResult<()> {
        self.storage
            .clone()
            .push(envelope)
            .await
            .map(|_| ())
            .map_err(|e| AppError::Queue(format!("Failed to requeue work item: {e}")))
    }
}

#[async_trait]
impl Redeliver for InMemoryWorkItemQueue {
    async fn redeliver(&self, envelope: WorkItemEnvelope) -> AppResult<()> {
        self.enqueue(envelope).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use faultline_common::{LockSettings, WorkerConfig};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::context::WorkItemContext;
    use crate::dispatcher::{ExecutionServices, HandlerRegistry, LockRequest, WorkItemHandler};
    use crate::lock::{CacheLockProvider, LockProvider};
    use crate::pubsub::InMemoryMessageBus;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TouchWorkItem {
        resource: String,
        fail: bool,
    }

    impl WorkItem for TouchWorkItem {
        const TYPE: &'static str = "touch";
    }

    struct TouchHandler;

    #[async_trait]
    impl WorkItemHandler for TouchHandler {
        type Payload = TouchWorkItem;

        fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
            LockRequest::exclusive(format!("touch:{}", payload.resource))
        }

        async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
            if ctx.data().fail {
                return Err(AppError::Internal("touch failed".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        locks: Arc<CacheLockProvider>,
        queue: Arc<InMemoryWorkItemQueue>,
        context: WorkerContext,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(InMemoryCacheClient::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let lock_settings = LockSettings {
            ttl_secs: 60,
            acquire_timeout_secs: 0,
            poll_interval_ms: 100,
        };
        let locks = Arc::new(CacheLockProvider::new(
            cache,
            bus.clone(),
            &lock_settings,
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(TouchHandler).unwrap();
        let services = ExecutionServices {
            locks: locks.clone(),
            throttle: locks.clone(),
            bus,
            lock_settings,
        };
        let dispatcher = Arc::new(WorkItemDispatcher::new(
            registry,
            services,
            &WorkerConfig::default(),
        ));
        let queue = Arc::new(InMemoryWorkItemQueue::new());

        Fixture {
            locks,
            queue: queue.clone(),
            context: WorkerContext {
                dispatcher,
                shutdown: CancellationToken::new(),
                redeliver: queue,
            },
        }
    }

    fn envelope(fail: bool) -> WorkItemEnvelope {
        WorkItemEnvelope::new(&TouchWorkItem {
            resource: "r1".to_string(),
            fail,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ack_completes_delivery() {
        let fixture = fixture();

        assert!(deliver(&fixture.context, envelope(false), 1).await.is_ok());
        assert_eq!(fixture.queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_shutdown_hands_item_back_without_failing() {
        let fixture = fixture();
        fixture.context.shutdown.cancel();
        let item = envelope(false);
        let id = item.id.clone();

        // Every apalis attempt sees the cancelled token; none may fail the job.
        for attempt in 1..=3 {
            assert!(deliver(&fixture.context, item.clone(), attempt).await.is_ok());
        }

        assert_eq!(fixture.queue.pending_len().await, 3);
        let redelivered = fixture
            .queue
            .dequeue(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.envelope.id, id);
        assert_eq!(redelivered.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_redelivers_after_backoff() {
        let fixture = fixture();
        let held = fixture
            .locks
            .acquire("touch:r1", Duration::from_secs(600), Duration::ZERO)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(deliver(&fixture.context, envelope(false), 1).await.is_ok());

        let expected = fixture.context.dispatcher.retry().delay_for_attempt(1);
        assert!(started.elapsed() >= expected);
        assert_eq!(fixture.queue.pending_len().await, 1);
        fixture.locks.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cuts_backoff_short() {
        let fixture = fixture();
        let held = fixture
            .locks
            .acquire("touch:r1", Duration::from_secs(600), Duration::ZERO)
            .await
            .unwrap();

        let shutdown = fixture.context.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            deliver(&fixture.context, envelope(false), 1),
        )
        .await
        .unwrap();

        assert!(outcome.is_ok());
        assert_eq!(fixture.queue.pending_len().await, 1);
        fixture.locks.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_goes_to_retry_layer() {
        let fixture = fixture();

        let outcome = deliver(&fixture.context, envelope(true), 1).await;

        assert!(matches!(outcome, Err(Error::Failed(_))));
        assert_eq!(fixture.queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_last_failure_aborts() {
        let fixture = fixture();
        let attempts = fixture.context.dispatcher.retry().max_attempts;

        let outcome = deliver(&fixture.context, envelope(true), attempts).await;

        assert!(matches!(outcome, Err(Error::Abort(_))));
    }
}
