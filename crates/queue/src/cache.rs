//! Shared cache port used by the lock providers and idempotency markers.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::{AppError, AppResult};
use fred::clients::Client as RedisClient;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Extend the ttl only while the stored value still matches.
const RENEW_IF_EQUAL: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
end
return 0
";

/// Delete only while the stored value still matches.
const REMOVE_IF_EQUAL: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
";

/// Atomic key/value operations with expiry.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Store `value` under `key` unless the key exists. Returns whether the
    /// value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Reset the ttl of `key` if it currently holds `expected`.
    async fn replace_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool>;

    /// Delete `key` if it currently holds `expected`.
    async fn remove_if_equal(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Increment a counter, starting its ttl on the first increment.
    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<u64>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn remove(&self, key: &str) -> AppResult<()>;
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn redis_error(e: fred::error::Error) -> AppError {
    AppError::Redis(e.to_string())
}

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCacheClient {
    redis: Arc<RedisClient>,
    prefix: String,
}

impl RedisCacheClient {
    /// Create a cache over a connected client. Every key is stored as
    /// `{prefix}:{key}`.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl CacheClient for RedisCacheClient {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        // NX returns None if key already exists, Some("OK") if set
        let result: Option<String> = self
            .redis
            .set(
                self.key(key),
                value,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(redis_error)?;
        Ok(result.is_some())
    }

    async fn replace_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool> {
        let updated: i64 = self
            .redis
            .eval(
                RENEW_IF_EQUAL,
                vec![self.key(key)],
                vec![expected.to_string(), millis(ttl).to_string()],
            )
            .await
            .map_err(redis_error)?;
        Ok(updated == 1)
    }

    async fn remove_if_equal(&self, key: &str, expected: &str) -> AppResult<bool> {
        let removed: i64 = self
            .redis
            .eval(
                REMOVE_IF_EQUAL,
                vec![self.key(key)],
                vec![expected.to_string()],
            )
            .await
            .map_err(redis_error)?;
        Ok(removed == 1)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<u64> {
        let key = self.key(key);
        let count: u64 = self.redis.incr(key.clone()).await.map_err(redis_error)?;

        // Set expiry on first increment
        if count == 1 {
            self.redis
                .pexpire::<(), _>(key, millis(ttl), None)
                .await
                .map_err(redis_error)?;
        }

        Ok(count)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.redis.get(self.key(key)).await.map_err(redis_error)
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        self.redis
            .del::<(), _>(self.key(key))
            .await
            .map_err(redis_error)
    }
}

/// Process-local cache following the tokio clock, so paused-time tests see
/// entries expire.
#[derive(Default)]
pub struct InMemoryCacheClient {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCacheClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, (String, Instant)>,
    key: &str,
) -> Option<&'a mut (String, Instant)> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|(_, expires_at)| *expires_at <= now) {
        debug!(key, "Cache entry expired");
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl CacheClient for InMemoryCacheClient {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn replace_if_equal(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some((value, expires_at)) if value.as_str() == expected => {
                *expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_if_equal(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        let matches = live(&mut entries, key).is_some_and(|(value, _)| value.as_str() == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> AppResult<u64> {
        let mut entries = self.entries.lock().await;
        if let Some((value, _)) = live(&mut entries, key) {
            let count = value
                .parse::<u64>()
                .map_err(|e| AppError::Internal(format!("counter {key} is not numeric: {e}")))?
                + 1;
            *value = count.to_string();
            return Ok(count);
        }
        entries.insert(key.to_string(), ("1".to_string(), Instant::now() + ttl));
        Ok(1)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key).map(|(value, _)| value.clone()))
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_until_expiry() {
        let cache = InMemoryCacheClient::new();
        let ttl = Duration::from_secs(10);

        assert!(cache.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!cache.set_if_absent("k", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_operations_check_value() {
        let cache = InMemoryCacheClient::new();
        let ttl = Duration::from_secs(10);
        cache.set_if_absent("k", "token", ttl).await.unwrap();

        assert!(!cache.replace_if_equal("k", "other", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.replace_if_equal("k", "token", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        // Renewed at 8s, so still alive at 16s.
        assert!(cache.get("k").await.unwrap().is_some());

        assert!(!cache.remove_if_equal("k", "other").await.unwrap());
        assert!(cache.remove_if_equal("k", "token").await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_window() {
        let cache = InMemoryCacheClient::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(cache.increment("hits", ttl).await.unwrap(), 1);
        assert_eq!(cache.increment("hits", ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.increment("hits", ttl).await.unwrap(), 1);
    }
}
