//! Exclusive lock over the shared cache, woken by release notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use faultline_common::{AppError, AppResult, IdGenerator, LockSettings, Metrics, get_metrics};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Lock, LockProvider};
use crate::cache::CacheClient;
use crate::pubsub::{BusMessage, MessageBus};

/// At most one holder per key across every process sharing the cache.
#[derive(Clone)]
pub struct CacheLockProvider {
    cache: Arc<dyn CacheClient>,
    bus: Arc<dyn MessageBus>,
    poll_interval: Duration,
    id_gen: IdGenerator,
    metrics: Arc<Metrics>,
}

impl CacheLockProvider {
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheClient>,
        bus: Arc<dyn MessageBus>,
        settings: &LockSettings,
    ) -> Self {
        Self {
            cache,
            bus,
            poll_interval: settings.poll_interval(),
            id_gen: IdGenerator::new(),
            metrics: Arc::clone(get_metrics()),
        }
    }

    fn cache_key(key: &str) -> String {
        format!("lock:{key}")
    }
}

/// Wait until `key` is reported released or `wait` elapses.
async fn wait_for_release(rx: &mut broadcast::Receiver<BusMessage>, key: &str, wait: Duration) {
    let released = async {
        loop {
            match rx.recv().await {
                Ok(BusMessage::LockReleased { key: released }) if released == key => return,
                Ok(_) => {}
                // Missed notifications may include ours.
                Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };
    let _ = tokio::time::timeout(wait, released).await;
}

#[async_trait]
impl LockProvider for CacheLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration, timeout: Duration) -> AppResult<Lock> {
        let cache_key = Self::cache_key(key);
        let token = self.id_gen.generate();
        let deadline = Instant::now() + timeout;

        // Subscribe before the first attempt so a release between the failed
        // attempt and the wait is not missed.
        let mut rx = self.bus.subscribe();

        loop {
            if self.cache.set_if_absent(&cache_key, &token, ttl).await? {
                Metrics::incr(&self.metrics.locks_acquired);
                debug!(key, token = %token, "Lock acquired");
                return Ok(Lock {
                    key: key.to_string(),
                    token,
                    ttl,
                    holder_since: Utc::now(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                Metrics::incr(&self.metrics.lock_timeouts);
                debug!(key, timeout_ms = timeout.as_millis() as u64, "Timed out acquiring lock");
                return Err(AppError::LockTimeout {
                    key: key.to_string(),
                });
            }

            wait_for_release(&mut rx, key, self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn renew(&self, lock: &Lock) -> AppResult<()> {
        let renewed = self
            .cache
            .replace_if_equal(&Self::cache_key(&lock.key), &lock.token, lock.ttl)
            .await?;

        if renewed {
            Metrics::incr(&self.metrics.locks_renewed);
            debug!(key = %lock.key, "Lock renewed");
            Ok(())
        } else {
            Metrics::incr(&self.metrics.locks_lost);
            warn!(key = %lock.key, token = %lock.token, "Lock lost before renewal");
            Err(AppError::LockLost {
                key: lock.key.clone(),
            })
        }
    }

    async fn release(&self, lock: &Lock) -> AppResult<()> {
        let removed = self
            .cache
            .remove_if_equal(&Self::cache_key(&lock.key), &lock.token)
            .await?;

        if removed {
            Metrics::incr(&self.metrics.locks_released);
            self.bus
                .publish(&BusMessage::LockReleased {
                    key: lock.key.clone(),
                })
                .await?;
            debug!(key = %lock.key, "Lock released");
        } else {
            debug!(key = %lock.key, "Lock already gone at release");
        }
        Ok(())
    }
}
