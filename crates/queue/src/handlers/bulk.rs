//! Paginated bulk mutation.

use std::future::Future;

use faultline_common::{AppResult, BulkSettings};
use faultline_core::PageRequest;
use tracing::debug;

use super::Stores;
use crate::context::{WorkItemContext, scaled_progress};

/// Result of processing one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStep {
    /// Items mutated on this page.
    pub processed: usize,
    /// Whether another page follows.
    pub has_more: bool,
    /// Size of the whole collection, when known.
    pub total: Option<u64>,
}

/// Walk a collection page by page, mapping progress into `[start, end]`.
///
/// Per page: check cancellation, run `step`, renew the lock, report progress.
/// Between pages the loop pauses for the configured delay so a sweep cannot
/// saturate the backend. Returns the number of items processed.
pub async fn for_each_page<T, F, Fut>(
    ctx: &WorkItemContext<T>,
    settings: &BulkSettings,
    (start, end): (u8, u8),
    message: &str,
    mut step: F,
) -> AppResult<u64>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = AppResult<PageStep>>,
{
    let page_size = settings.page_size.max(1);
    let mut page = 1;
    let mut completed = 0u64;

    loop {
        ctx.check_cancelled()?;

        let outcome = step(PageRequest::new(page, page_size)).await?;
        completed += outcome.processed as u64;

        ctx.renew_lock().await?;

        let more = outcome.has_more && outcome.processed > 0;
        let total = outcome.total.unwrap_or(if more {
            completed + page_size as u64
        } else {
            completed
        });
        ctx.report_progress(scaled_progress(completed, total, start, end), Some(message))
            .await;
        debug!(page, processed = outcome.processed, completed, total, "Page processed");

        if !more {
            return Ok(completed);
        }

        page += 1;
        ctx.sleep(settings.page_delay()).await?;
    }
}

/// Delete a project's events, then its stacks.
pub async fn purge_project_data<T>(
    ctx: &WorkItemContext<T>,
    stores: &Stores,
    settings: &BulkSettings,
    project_id: &str,
    (start, end): (u8, u8),
) -> AppResult<(u64, u64)> {
    let middle = start + (end.saturating_sub(start)) / 2;

    let event_total = stores.events.count_by_project_id(project_id).await?;
    let events = for_each_page(ctx, settings, (start, middle), "Removing events", |page| async move {
        // Removed rows drop out of the query, so always read the head.
        let ids = stores
            .events
            .get_ids_by_project_id(project_id, page.limit)
            .await?;
        let removed = stores.events.remove(&ids).await?;
        Ok(PageStep {
            processed: removed as usize,
            has_more: ids.len() == page.limit,
            total: Some(event_total),
        })
    })
    .await?;

    let stack_total = stores.stacks.count_by_project_id(project_id).await?;
    let stacks = for_each_page(ctx, settings, (middle, end), "Removing stacks", |page| async move {
        let ids = stores
            .stacks
            .get_ids_by_project_id(project_id, page.limit)
            .await?;
        let removed = stores.stacks.remove(&ids).await?;
        Ok(PageStep {
            processed: removed as usize,
            has_more: ids.len() == page.limit,
            total: Some(stack_total),
        })
    })
    .await?;

    debug!(project_id, events, stacks, "Project data purged");
    Ok((events, stacks))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use faultline_common::AppError;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::lock::{Lock, LockHandle, LockProvider};
    use crate::pubsub::InMemoryMessageBus;

    #[derive(Default)]
    struct CountingLocks {
        renewals: AtomicU32,
        releases: AtomicU32,
    }

    #[async_trait]
    impl LockProvider for CountingLocks {
        async fn acquire(&self, key: &str, ttl: Duration, _timeout: Duration) -> AppResult<Lock> {
            Ok(Lock {
                key: key.to_string(),
                token: "token".to_string(),
                ttl,
                holder_since: Utc::now(),
            })
        }

        async fn renew(&self, _lock: &Lock) -> AppResult<()> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self, _lock: &Lock) -> AppResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn context(
        locks: Arc<CountingLocks>,
        cancel: CancellationToken,
    ) -> WorkItemContext<()> {
        let lock = LockHandle::acquire(locks, "bulk", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        WorkItemContext::new(
            "wi1",
            "test",
            1,
            (),
            Arc::new(lock),
            cancel,
            Arc::new(InMemoryMessageBus::new()),
        )
    }

    const SETTINGS: BulkSettings = BulkSettings {
        page_size: 100,
        page_delay_ms: 2500,
    };

    fn page_of(total: usize, page: PageRequest) -> PageStep {
        let remaining = total.saturating_sub(page.offset());
        let processed = remaining.min(page.limit);
        PageStep {
            processed,
            has_more: page.offset() + processed < total,
            total: Some(total as u64),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_250_items_take_three_pages_and_two_pauses() {
        let locks = Arc::new(CountingLocks::default());
        let ctx = context(locks.clone(), CancellationToken::new()).await;
        let fetches = AtomicUsize::new(0);

        let started = Instant::now();
        let completed = for_each_page(&ctx, &SETTINGS, (0, 100), "Processing", |page| {
            fetches.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_of(250, page)) }
        })
        .await
        .unwrap();

        assert_eq!(completed, 250);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert!(locks.renewals.load(Ordering::SeqCst) >= 2);
        // Two pauses of 2.5s and nothing else advances the clock.
        assert_eq!(started.elapsed().as_millis() / 100, 50);
        assert_eq!(ctx.last_progress().unwrap().0, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_first_page_stops_fetching() {
        let locks = Arc::new(CountingLocks::default());
        let cancel = CancellationToken::new();
        let ctx = context(locks.clone(), cancel.clone()).await;
        let fetches = AtomicUsize::new(0);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            cancel.cancel();
        });

        let result = for_each_page(&ctx, &SETTINGS, (0, 100), "Processing", |page| {
            fetches.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_of(250, page)) }
        })
        .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(locks.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_total_still_ends_at_phase_end() {
        let locks = Arc::new(CountingLocks::default());
        let ctx = context(locks, CancellationToken::new()).await;

        for_each_page(&ctx, &SETTINGS, (10, 60), "Hiding", |page| async move {
            let mut step = page_of(150, page);
            step.total = None;
            Ok(step)
        })
        .await
        .unwrap();

        assert_eq!(ctx.last_progress().unwrap().0, 60);
    }
}
