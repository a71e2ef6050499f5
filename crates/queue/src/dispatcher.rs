//! Handler registry and dispatcher.
//!
//! Per work item: decode the envelope, look up the handler by type, take the
//! lock the handler asks for, run it with a [`WorkItemContext`], release the
//! lock and map the outcome to a [`Disposition`] for the queue.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::{
    AppError, AppResult, LockSettings, Metrics, WorkerConfig, get_metrics,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::WorkItemContext;
use crate::jobs::{WorkItem, WorkItemEnvelope};
use crate::lock::{LockHandle, LockProvider};
use crate::pubsub::{BusMessage, MessageBus};
use crate::queue::{QueueEntry, WorkItemQueue};
use crate::retry::RetryConfig;

/// How long one `dequeue` call waits before the loop re-checks shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_secs(1);
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Which provider guards a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// One holder at a time.
    Exclusive,
    /// A bounded number of grants per period.
    Throttled,
}

/// Lock a handler needs before it may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub key: String,
    pub mode: LockMode,
    /// Overrides the configured lock ttl.
    pub ttl: Option<Duration>,
    /// Overrides the configured acquire timeout.
    pub acquire_timeout: Option<Duration>,
}

impl LockRequest {
    /// Exclusive lock on `key`. Use a fixed key for sweeps that must never
    /// overlap and a key containing the entity id otherwise.
    #[must_use]
    pub fn exclusive(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: LockMode::Exclusive,
            ttl: None,
            acquire_timeout: None,
        }
    }

    #[must_use]
    pub fn throttled(key: impl Into<String>) -> Self {
        Self {
            mode: LockMode::Throttled,
            ..Self::exclusive(key)
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// One maintenance operation.
#[async_trait]
pub trait WorkItemHandler: Send + Sync + 'static {
    type Payload: WorkItem;

    /// The lock to hold while handling `payload`.
    fn lock_request(&self, payload: &Self::Payload) -> LockRequest;

    /// Do the work. Must be safe to run again after a crash or lost lock.
    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()>;
}

/// What the queue should do with a processed work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove it.
    Ack,
    /// Make it visible again for a later attempt. `transient` marks lock
    /// contention, lost locks and cancellation, which never use up the
    /// attempt budget.
    Abandon { reason: String, transient: bool },
    /// Park it for an operator.
    DeadLetter { reason: String },
}

/// Lock providers and bus shared by every handler run.
#[derive(Clone)]
pub struct ExecutionServices {
    pub locks: Arc<dyn LockProvider>,
    pub throttle: Arc<dyn LockProvider>,
    pub bus: Arc<dyn MessageBus>,
    pub lock_settings: LockSettings,
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn execute(
        &self,
        envelope: &WorkItemEnvelope,
        attempt: u32,
        services: &ExecutionServices,
        cancel: CancellationToken,
    ) -> AppResult<()>;
}

#[async_trait]
impl<H: WorkItemHandler> ErasedHandler for H {
    async fn execute(
        &self,
        envelope: &WorkItemEnvelope,
        attempt: u32,
        services: &ExecutionServices,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        let payload: H::Payload = envelope.decode()?;
        let request = self.lock_request(&payload);
        let provider = match request.mode {
            LockMode::Exclusive => Arc::clone(&services.locks),
            LockMode::Throttled => Arc::clone(&services.throttle),
        };

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let lock = Arc::new(
            LockHandle::acquire(
                provider,
                &request.key,
                request.ttl.unwrap_or_else(|| services.lock_settings.ttl()),
                request
                    .acquire_timeout
                    .unwrap_or_else(|| services.lock_settings.acquire_timeout()),
            )
            .await?,
        );

        let ctx = WorkItemContext::new(
            envelope.id.clone(),
            H::Payload::TYPE,
            attempt,
            payload,
            Arc::clone(&lock),
            cancel,
            Arc::clone(&services.bus),
        );
        ctx.report_progress(0, Some("Starting")).await;

        let result = self.handle(&ctx).await;

        // A lost lock belongs to someone else now.
        if !matches!(result, Err(AppError::LockLost { .. })) {
            if let Err(e) = lock.release().await {
                warn!(key = %lock.key(), error = %e, "Failed to release lock");
            }
        }

        result
    }
}

/// Maps work-item type discriminants to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `H::Payload::TYPE`. Each type takes exactly
    /// one handler.
    pub fn register<H: WorkItemHandler>(&mut self, handler: H) -> AppResult<()> {
        let work_item_type = H::Payload::TYPE;
        if self.handlers.contains_key(work_item_type) {
            return Err(AppError::Config(format!(
                "handler for work item type {work_item_type} registered twice"
            )));
        }
        self.handlers.insert(work_item_type, Arc::new(handler));
        debug!(work_item_type, "Registered work item handler");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, work_item_type: &str) -> bool {
        self.handlers.contains_key(work_item_type)
    }

    /// Registered discriminants in sorted order.
    #[must_use]
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// Runs work items through their handlers.
pub struct WorkItemDispatcher {
    registry: HandlerRegistry,
    services: ExecutionServices,
    retry: RetryConfig,
    concurrency: usize,
    shutdown_grace: Duration,
    metrics: Arc<Metrics>,
}

impl WorkItemDispatcher {
    #[must_use]
    pub fn new(registry: HandlerRegistry, services: ExecutionServices, worker: &WorkerConfig) -> Self {
        Self {
            registry,
            services,
            retry: RetryConfig::from_worker(worker),
            concurrency: worker.concurrency.max(1),
            shutdown_grace: worker.shutdown_grace(),
            metrics: Arc::clone(get_metrics()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Process one delivery of a work item. `attempt` starts at 1.
    pub async fn process(
        &self,
        envelope: &WorkItemEnvelope,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Disposition {
        Metrics::incr(&self.metrics.work_items_received);
        let span = info_span!(
            "work_item",
            id = %envelope.id,
            r#type = %envelope.work_item_type,
            attempt
        );

        async {
            let result = match self.registry.handlers.get(envelope.work_item_type.as_str()) {
                Some(handler) => {
                    handler
                        .execute(envelope, attempt, &self.services, cancel)
                        .await
                }
                None => Err(AppError::UnknownWorkItemType(
                    envelope.work_item_type.clone(),
                )),
            };

            let disposition = self.disposition(&result, attempt);
            self.publish_outcome(envelope, result.err(), &disposition)
                .await;
            disposition
        }
        .instrument(span)
        .await
    }

    fn disposition(&self, result: &AppResult<()>, attempt: u32) -> Disposition {
        let e = match result {
            Ok(()) => {
                Metrics::incr(&self.metrics.work_items_completed);
                info!("Work item completed");
                return Disposition::Ack;
            }
            Err(e) => e,
        };

        match e {
            AppError::NotFound(what) => {
                Metrics::incr(&self.metrics.work_items_completed);
                info!(target_id = %what, "Work item target no longer exists, nothing to do");
                Disposition::Ack
            }
            AppError::LockTimeout { key } => {
                Metrics::incr(&self.metrics.work_items_abandoned);
                debug!(key = %key, "Lock busy, abandoning for redelivery");
                Disposition::Abandon {
                    reason: e.to_string(),
                    transient: true,
                }
            }
            AppError::LockLost { key } => {
                Metrics::incr(&self.metrics.work_items_abandoned);
                warn!(key = %key, "Lock lost mid-run, abandoning for redelivery");
                Disposition::Abandon {
                    reason: e.to_string(),
                    transient: true,
                }
            }
            AppError::Cancelled => {
                Metrics::incr(&self.metrics.work_items_abandoned);
                info!("Work item cancelled, abandoning for redelivery");
                Disposition::Abandon {
                    reason: e.to_string(),
                    transient: true,
                }
            }
            e if e.is_terminal() => {
                Metrics::incr(&self.metrics.work_items_failed);
                Metrics::incr(&self.metrics.work_items_dead_lettered);
                error!(error_code = e.error_code(), error = %e, "Work item failed permanently");
                Disposition::DeadLetter {
                    reason: e.to_string(),
                }
            }
            e if self.retry.should_retry(attempt) => {
                Metrics::incr(&self.metrics.work_items_failed);
                Metrics::incr(&self.metrics.work_items_abandoned);
                warn!(
                    error_code = e.error_code(),
                    error = %e,
                    retry_in_secs = self.retry.delay_for_attempt(attempt).as_secs(),
                    "Work item failed, abandoning for retry"
                );
                Disposition::Abandon {
                    reason: e.to_string(),
                    transient: false,
                }
            }
            e => {
                Metrics::incr(&self.metrics.work_items_failed);
                Metrics::incr(&self.metrics.work_items_dead_lettered);
                error!(
                    error_code = e.error_code(),
                    error = %e,
                    max_attempts = self.retry.max_attempts,
                    "Work item failed on its last attempt"
                );
                Disposition::DeadLetter {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn publish_outcome(
        &self,
        envelope: &WorkItemEnvelope,
        error: Option<AppError>,
        disposition: &Disposition,
    ) {
        let message = match (disposition, error) {
            (Disposition::Ack, _) => BusMessage::WorkItemCompleted {
                work_item_id: envelope.id.clone(),
                work_item_type: envelope.work_item_type.clone(),
            },
            (_, Some(e)) => BusMessage::WorkItemFailed {
                work_item_id: envelope.id.clone(),
                work_item_type: envelope.work_item_type.clone(),
                error_code: e.error_code().to_string(),
                error: e.to_string(),
            },
            (_, None) => return,
        };

        if let Err(e) = self.services.bus.publish(&message).await {
            warn!(error = %e, "Failed to publish work item outcome");
        }
    }

    /// Process a dequeued entry and settle it on the queue.
    pub async fn settle(
        &self,
        queue: &dyn WorkItemQueue,
        entry: QueueEntry,
        cancel: CancellationToken,
    ) {
        let disposition = self.process(&entry.envelope, entry.attempt, cancel).await;

        let settled = match &disposition {
            Disposition::Ack => queue.ack(&entry).await,
            Disposition::Abandon { .. } => queue.abandon(&entry).await,
            Disposition::DeadLetter { reason } => queue.dead_letter(&entry, reason).await,
        };

        if let Err(e) = settled {
            error!(
                work_item_id = %entry.envelope.id,
                ?disposition,
                error = %e,
                "Failed to settle work item"
            );
        }
    }

    /// Pull from `queue` until `shutdown` fires, keeping up to the configured
    /// concurrency in flight.
    ///
    /// Shutdown cancels running handlers at their next check point; they get
    /// the configured grace period to release their locks before they are
    /// aborted.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn WorkItemQueue>,
        shutdown: CancellationToken,
    ) -> AppResult<()> {
        let mut in_flight = JoinSet::new();
        info!(concurrency = self.concurrency, "Work item dispatcher started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Work item task panicked");
                }
            }

            if in_flight.len() >= self.concurrency {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = in_flight.join_next() => continue,
                }
            }

            let entry = tokio::select! {
                () = shutdown.cancelled() => break,
                entry = queue.dequeue(DEQUEUE_WAIT) => entry,
            };
            let entry = match entry {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue work item, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let dispatcher = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let cancel = shutdown.child_token();
            in_flight.spawn(async move {
                dispatcher.settle(queue.as_ref(), entry, cancel).await;
            });
        }

        info!(in_flight = in_flight.len(), "Shutting down, draining in-flight work items");
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "Grace period elapsed, aborting work items"
            );
            in_flight.abort_all();
        }

        info!("Work item dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::lock::CacheLockProvider;
    use crate::pubsub::InMemoryMessageBus;
    use crate::queue::InMemoryWorkItemQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum Behavior {
        Succeed,
        Fail,
        LoseLock,
        WaitForCancel,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ScriptedWorkItem {
        resource: String,
        behavior: Behavior,
    }

    impl WorkItem for ScriptedWorkItem {
        const TYPE: &'static str = "scripted";
    }

    struct ScriptedHandler;

    #[async_trait]
    impl WorkItemHandler for ScriptedHandler {
        type Payload = ScriptedWorkItem;

        fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
            LockRequest::exclusive(format!("scripted:{}", payload.resource))
        }

        async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
            match ctx.data().behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(AppError::Internal("scripted failure".to_string())),
                Behavior::LoseLock => Err(AppError::LockLost {
                    key: ctx.lock().key().to_string(),
                }),
                Behavior::WaitForCancel => loop {
                    ctx.sleep(Duration::from_secs(1)).await?;
                    ctx.renew_lock().await?;
                },
            }
        }
    }

    struct Fixture {
        locks: Arc<CacheLockProvider>,
        bus: Arc<InMemoryMessageBus>,
        dispatcher: WorkItemDispatcher,
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
            cache.clone(),
            bus.clone(),
            &lock_settings,
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptedHandler).unwrap();

        let services = ExecutionServices {
            locks: locks.clone(),
            throttle: locks.clone(),
            bus: bus.clone(),
            lock_settings,
        };
        let worker = WorkerConfig {
            max_attempts: 2,
            ..WorkerConfig::default()
        };
        Fixture {
            locks,
            bus,
            dispatcher: WorkItemDispatcher::new(registry, services, &worker),
        }
    }

    fn envelope(behavior: Behavior) -> WorkItemEnvelope {
        WorkItemEnvelope::new(&ScriptedWorkItem {
            resource: "r1".to_string(),
            behavior,
        })
        .unwrap()
    }

    async fn lock_is_free(locks: &CacheLockProvider) -> bool {
        match locks.acquire("scripted:r1", Duration::from_secs(60), Duration::ZERO).await {
            Ok(lock) => {
                locks.release(&lock).await.unwrap();
                true
            }
            Err(_) => false,
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptedHandler).unwrap();
        assert!(matches!(
            registry.register(ScriptedHandler),
            Err(AppError::Config(_))
        ));
        assert_eq!(registry.registered_types(), vec!["scripted"]);
    }

    #[tokio::test]
    async fn test_success_releases_lock_and_publishes_completion() {
        let fixture = fixture();
        let mut rx = fixture.bus.subscribe();

        let disposition = fixture
            .dispatcher
            .process(&envelope(Behavior::Succeed), 1, CancellationToken::new())
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert!(lock_is_free(&fixture.locks).await);

        let mut saw_start = false;
        let mut saw_completed = false;
        while let Ok(message) = rx.try_recv() {
            match message {
                BusMessage::WorkItemStatus { progress: 0, .. } => saw_start = true,
                BusMessage::WorkItemCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_start);
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_failure_retries_then_dead_letters() {
        let fixture = fixture();

        assert!(matches!(
            fixture
                .dispatcher
                .process(&envelope(Behavior::Fail), 1, CancellationToken::new())
                .await,
            Disposition::Abandon { .. }
        ));
        assert!(matches!(
            fixture
                .dispatcher
                .process(&envelope(Behavior::Fail), 2, CancellationToken::new())
                .await,
            Disposition::DeadLetter { .. }
        ));
        assert!(lock_is_free(&fixture.locks).await);
    }

    #[tokio::test]
    async fn test_lost_lock_is_not_released() {
        let fixture = fixture();

        let disposition = fixture
            .dispatcher
            .process(&envelope(Behavior::LoseLock), 5, CancellationToken::new())
            .await;

        // Transient even past the attempt budget.
        assert!(matches!(
            disposition,
            Disposition::Abandon {
                transient: true,
                ..
            }
        ));
        assert!(!lock_is_free(&fixture.locks).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_lock() {
        let fixture = Arc::new(fixture());
        let cancel = CancellationToken::new();

        let running = {
            let fixture = Arc::clone(&fixture);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fixture
                    .dispatcher
                    .process(&envelope(Behavior::WaitForCancel), 1, cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!lock_is_free(&fixture.locks).await);

        cancel.cancel();
        let disposition = running.await.unwrap();

        assert!(matches!(disposition, Disposition::Abandon { .. }));
        assert!(lock_is_free(&fixture.locks).await);
    }

    /// Queue whose first `failures` dequeues error out.
    struct FlakyQueue {
        inner: InMemoryWorkItemQueue,
        failures: AtomicU32,
    }

    #[async_trait]
    impl WorkItemQueue for FlakyQueue {
        async fn enqueue(&self, envelope: WorkItemEnvelope) -> AppResult<()> {
            self.inner.enqueue(envelope).await
        }

        async fn dequeue(&self, wait: Duration) -> AppResult<Option<QueueEntry>> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AppError::Queue("connection reset".to_string()));
            }
            self.inner.dequeue(wait).await
        }

        async fn ack(&self, entry: &QueueEntry) -> AppResult<()> {
            self.inner.ack(entry).await
        }

        async fn abandon(&self, entry: &QueueEntry) -> AppResult<()> {
            self.inner.abandon(entry).await
        }

        async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> AppResult<()> {
            self.inner.dead_letter(entry, reason).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_dequeue_errors() {
        let fixture = fixture();
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryWorkItemQueue::new(),
            failures: AtomicU32::new(2),
        });
        let item = envelope(Behavior::Succeed);
        let id = item.id.clone();
        queue.enqueue(item).await.unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(Arc::new(fixture.dispatcher).run(
            queue.clone() as Arc<dyn WorkItemQueue>,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(queue.inner.completed().await, vec![id]);
        assert_eq!(queue.failures.load(Ordering::SeqCst), 0);
        assert!(lock_is_free(&fixture.locks).await);
    }
}
