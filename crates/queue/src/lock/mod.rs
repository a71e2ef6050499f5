//! Distributed locks.
//!
//! The shared cache entry `key -> token` is the only record of who holds a
//! lock. A holder proves ownership with its token on every renew and release,
//! and the entry's ttl frees the lock when a holder dies without releasing.

#![allow(missing_docs)]

mod cache;
mod throttling;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_common::AppResult;

pub use cache::CacheLockProvider;
pub use throttling::ThrottlingLockProvider;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    /// Unique per grant; proves ownership.
    pub token: String,
    pub ttl: Duration,
    pub holder_since: DateTime<Utc>,
}

/// Acquire, renew and release named locks.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Wait up to `timeout` for the lock. Fails with
    /// [`AppError::LockTimeout`](faultline_common::AppError::LockTimeout).
    async fn acquire(&self, key: &str, ttl: Duration, timeout: Duration) -> AppResult<Lock>;

    /// Restart the lock's ttl. Fails with
    /// [`AppError::LockLost`](faultline_common::AppError::LockLost) once the
    /// lock expired or another holder took it.
    async fn renew(&self, lock: &Lock) -> AppResult<()>;

    /// Give the lock up. Releasing a lock that is no longer held succeeds.
    async fn release(&self, lock: &Lock) -> AppResult<()>;
}

/// A held lock bound to the provider that granted it.
pub struct LockHandle {
    lock: Lock,
    provider: Arc<dyn LockProvider>,
    renewals: AtomicU32,
}

impl LockHandle {
    /// Acquire `key` from `provider`.
    pub async fn acquire(
        provider: Arc<dyn LockProvider>,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> AppResult<Self> {
        let lock = provider.acquire(key, ttl, timeout).await?;
        Ok(Self {
            lock,
            provider,
            renewals: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.lock.key
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.lock.token
    }

    #[must_use]
    pub const fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Successful renewals so far.
    #[must_use]
    pub fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::Relaxed)
    }

    pub async fn renew(&self) -> AppResult<()> {
        self.provider.renew(&self.lock).await?;
        self.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn release(&self) -> AppResult<()> {
        self.provider.release(&self.lock).await
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock", &self.lock)
            .field("renewals", &self.renewals())
            .finish_non_exhaustive()
    }
}
