//! Work item execution for faultline.
//!
//! - **Locks**: renewable distributed locks over a shared cache, woken early
//!   through pub/sub, plus a throttling variant
//! - **Dispatcher**: registry of handlers keyed by work item type, per-run
//!   context with progress, cancellation and lock renewal
//! - **Handlers**: organization and project removal, index migration,
//!   maintenance sweeps, location lookup, bot throttling, notifications
//! - **Transport**: apalis Redis storage for the fleet, an in-process queue
//!   for single-node runs and tests
//! - **Retry**: exponential backoff with dead letter entries

pub mod cache;
pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod jobs;
pub mod lock;
pub mod pubsub;
pub mod queue;
pub mod retry;
pub mod worker;

pub use cache::{CacheClient, InMemoryCacheClient, RedisCacheClient};
pub use context::{WorkItemContext, scaled_progress};
pub use dispatcher::{
    Disposition, ExecutionServices, HandlerRegistry, LockMode, LockRequest, WorkItemDispatcher,
    WorkItemHandler,
};
pub use handlers::{HandlerDependencies, Stores, default_registry};
pub use jobs::*;
pub use lock::{CacheLockProvider, Lock, LockHandle, LockProvider, ThrottlingLockProvider};
pub use pubsub::{BusMessage, InMemoryMessageBus, MessageBus, RedisPubSub, channels as pubsub_channels};
pub use queue::{InMemoryWorkItemQueue, QueueEntry, WorkItemQueue};
pub use retry::{DeadLetterEntry, RetryConfig};
pub use worker::{Redeliver, RedisWorkItemProducer, WorkerContext, deliver, work_item_worker};
