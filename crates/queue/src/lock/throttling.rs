//! Windowed grant counter: at most N acquisitions per key per period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use faultline_common::{
    AppError, AppResult, IdGenerator, Metrics, ThrottlingSettings, get_metrics,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Lock, LockProvider};
use crate::cache::CacheClient;

/// Grants do not exclude each other; they only count against the window.
/// Renewing and releasing a grant are no-ops.
#[derive(Clone)]
pub struct ThrottlingLockProvider {
    cache: Arc<dyn CacheClient>,
    max_hits_per_period: u64,
    period: Duration,
    id_gen: IdGenerator,
    metrics: Arc<Metrics>,
}

impl ThrottlingLockProvider {
    #[must_use]
    pub fn new(cache: Arc<dyn CacheClient>, settings: &ThrottlingSettings) -> Self {
        Self {
            cache,
            max_hits_per_period: settings.max_hits_per_period,
            period: settings.period().max(Duration::from_millis(1)),
            id_gen: IdGenerator::new(),
            metrics: Arc::clone(get_metrics()),
        }
    }

    fn period_millis(&self) -> i64 {
        i64::try_from(self.period.as_millis()).unwrap_or(i64::MAX)
    }

    /// Index of the current window and the time left in it.
    fn current_window(&self) -> (i64, Duration) {
        let period = self.period_millis();
        let now = Utc::now().timestamp_millis();
        let remaining = period - now.rem_euclid(period);
        (
            now.div_euclid(period),
            Duration::from_millis(remaining.unsigned_abs()),
        )
    }
}

#[async_trait]
impl LockProvider for ThrottlingLockProvider {
    async fn acquire(&self, key: &str, _ttl: Duration, timeout: Duration) -> AppResult<Lock> {
        let deadline = Instant::now() + timeout;

        loop {
            let (window, window_left) = self.current_window();
            let count = self
                .cache
                .increment(&format!("throttle:{key}:{window}"), self.period)
                .await?;

            if count <= self.max_hits_per_period {
                Metrics::incr(&self.metrics.throttle_grants);
                debug!(key, window, count, limit = self.max_hits_per_period, "Throttle grant");
                return Ok(Lock {
                    key: key.to_string(),
                    token: self.id_gen.generate(),
                    ttl: self.period,
                    holder_since: Utc::now(),
                });
            }

            Metrics::incr(&self.metrics.throttle_denials);
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    key,
                    count,
                    limit = self.max_hits_per_period,
                    "Throttle window exhausted"
                );
                return Err(AppError::LockTimeout {
                    key: key.to_string(),
                });
            }

            tokio::time::sleep(window_left.min(deadline - now)).await;
        }
    }

    async fn renew(&self, _lock: &Lock) -> AppResult<()> {
        Ok(())
    }

    async fn release(&self, _lock: &Lock) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;

    fn throttle(max_hits_per_period: u64, period_secs: u64) -> ThrottlingLockProvider {
        ThrottlingLockProvider::new(
            Arc::new(InMemoryCacheClient::new()),
            &ThrottlingSettings {
                max_hits_per_period,
                period_secs,
            },
        )
    }

    #[tokio::test]
    async fn test_grants_up_to_limit() {
        let throttle = throttle(2, 3600);
        let ttl = Duration::from_secs(60);

        assert!(throttle.acquire("sweep", ttl, Duration::ZERO).await.is_ok());
        assert!(throttle.acquire("sweep", ttl, Duration::ZERO).await.is_ok());
        assert!(matches!(
            throttle.acquire("sweep", ttl, Duration::ZERO).await,
            Err(AppError::LockTimeout { .. })
        ));

        // Other keys count separately.
        assert!(throttle.acquire("other", ttl, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_renew_and_release_are_noops() {
        let throttle = throttle(1, 3600);
        let lock = throttle
            .acquire("sweep", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        throttle.renew(&lock).await.unwrap();
        throttle.release(&lock).await.unwrap();

        // Releasing does not hand the grant back.
        assert!(
            throttle
                .acquire("sweep", Duration::from_secs(60), Duration::ZERO)
                .await
                .is_err()
        );
    }

    #[test]
    fn test_window_remaining_within_period() {
        let throttle = throttle(1, 900);
        let (window, left) = throttle.current_window();
        assert!(window > 0);
        assert!(left > Duration::ZERO && left <= Duration::from_secs(900));
    }
}
