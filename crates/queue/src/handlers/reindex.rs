//! Dual-pass index migration with gated cutover.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use faultline_common::{AppError, AppResult, BulkSettings};
use faultline_core::{ScrollQuery, SearchDocument, SearchIndexClient};
use tracing::{debug, error, info, warn};

use crate::context::{WorkItemContext, scaled_progress};
use crate::dispatcher::{LockRequest, WorkItemHandler};
use crate::jobs::{ReindexWorkItem, WorkItem};

/// Totals of one copy pass.
#[derive(Debug, Default)]
struct CopyOutcome {
    copied: u64,
    failed_ids: Vec<String>,
}

/// Copies an old index into a new one, repoints the alias and drops the old
/// index once the new one is known to hold at least as many documents.
pub struct ReindexHandler {
    search: Arc<dyn SearchIndexClient>,
    bulk: BulkSettings,
}

impl ReindexHandler {
    #[must_use]
    pub fn new(search: Arc<dyn SearchIndexClient>, bulk: BulkSettings) -> Self {
        Self { search, bulk }
    }

    /// Scroll `from` with `query` and write every batch into `to`.
    ///
    /// Batches rejected wholesale, and items the bulk endpoint rejects, are
    /// retried one document at a time. Documents that still fail are
    /// collected rather than aborting the pass.
    async fn copy(
        &self,
        ctx: &WorkItemContext<ReindexWorkItem>,
        query: &ScrollQuery,
        (start, end): (u8, u8),
        message: &str,
    ) -> AppResult<CopyOutcome> {
        let payload = ctx.data();
        let total = if query.modified_since.is_none() {
            Some(self.search.count(&payload.old_index).await?)
        } else {
            None
        };

        let mut outcome = CopyOutcome::default();
        let mut cursor: Option<String> = None;
        let page_size = self.bulk.page_size.max(1);

        loop {
            ctx.check_cancelled()?;

            let page = self
                .search
                .scroll(&payload.old_index, query, cursor.as_deref(), page_size)
                .await?;
            if page.documents.is_empty() {
                break;
            }

            let failed = self.write_batch(&payload.new_index, &page.documents).await;
            outcome.copied += (page.documents.len() - failed.len()) as u64;
            outcome.failed_ids.extend(failed);

            ctx.renew_lock().await?;

            let seen = outcome.copied + outcome.failed_ids.len() as u64;
            let estimate = total.unwrap_or(if page.cursor.is_some() {
                seen + page_size as u64
            } else {
                seen
            });
            ctx.report_progress(scaled_progress(seen, estimate, start, end), Some(message))
                .await;

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        ctx.report_progress(end, Some(message)).await;
        Ok(outcome)
    }

    /// Write one batch, returning the ids that could not be written.
    async fn write_batch(&self, index: &str, documents: &[SearchDocument]) -> Vec<String> {
        let retry: Vec<&SearchDocument> = match self.search.bulk_index(index, documents).await {
            Ok(response) if response.is_success() => return Vec::new(),
            Ok(response) => {
                warn!(
                    index,
                    failed = response.failed.len(),
                    "Bulk write partially rejected, retrying items individually"
                );
                documents
                    .iter()
                    .filter(|d| response.failed.iter().any(|f| f.id == d.id))
                    .collect()
            }
            Err(e) => {
                warn!(
                    index,
                    batch = documents.len(),
                    error = %e,
                    "Bulk write rejected, retrying documents individually"
                );
                documents.iter().collect()
            }
        };

        let mut failed = Vec::new();
        for document in retry {
            if let Err(e) = self.search.index_document(index, document).await {
                error!(index, document_id = %document.id, error = %e, "Document could not be reindexed");
                failed.push(document.id.clone());
            }
        }
        failed
    }
}

#[async_trait]
impl WorkItemHandler for ReindexHandler {
    type Payload = ReindexWorkItem;

    fn lock_request(&self, payload: &Self::Payload) -> LockRequest {
        LockRequest::exclusive(format!("{}:{}", ReindexWorkItem::TYPE, payload.alias))
    }

    async fn handle(&self, ctx: &WorkItemContext<Self::Payload>) -> AppResult<()> {
        let payload = ctx.data();
        let alias = payload.alias.as_str();
        let current = self.search.alias_target(alias).await?;

        if !self.search.index_exists(&payload.old_index).await? {
            if current.as_deref() == Some(payload.new_index.as_str()) {
                info!(alias, new_index = %payload.new_index, "Alias already migrated");
                ctx.report_progress(100, Some("Already migrated")).await;
                return Ok(());
            }
            return Err(AppError::NotFound(format!("index {}", payload.old_index)));
        }
        if !self.search.index_exists(&payload.new_index).await? {
            return Err(AppError::Search(format!(
                "target index {} does not exist",
                payload.new_index
            )));
        }

        info!(
            alias,
            old_index = %payload.old_index,
            new_index = %payload.new_index,
            "Starting reindex"
        );

        let started = Utc::now();
        let first = self
            .copy(ctx, &ScrollQuery::all(), (0, 90), "Copying documents")
            .await?;
        if !first.failed_ids.is_empty() {
            error!(alias, failed = first.failed_ids.len(), "Reindex left documents behind, keeping alias");
            return Err(AppError::PartialBatchFailure {
                failed_ids: first.failed_ids,
            });
        }
        info!(alias, copied = first.copied, "First pass finished");

        if current.as_deref() == Some(payload.new_index.as_str()) {
            debug!(alias, "Alias already points at the new index");
        } else {
            self.search
                .swap_alias(alias, current.as_deref(), &payload.new_index)
                .await?;
            info!(alias, from = current.as_deref(), to = %payload.new_index, "Alias repointed");
        }

        let catch_up = ScrollQuery::modified_since(&payload.time_field, started);
        let second = self
            .copy(ctx, &catch_up, (90, 98), "Copying recent changes")
            .await?;
        if !second.failed_ids.is_empty() {
            error!(alias, failed = second.failed_ids.len(), "Catch-up pass left documents behind");
            return Err(AppError::PartialBatchFailure {
                failed_ids: second.failed_ids,
            });
        }
        info!(alias, copied = second.copied, "Second pass finished");

        if !payload.delete_old {
            ctx.report_progress(100, Some("Reindex complete")).await;
            return Ok(());
        }

        ctx.check_cancelled()?;
        let old_count = self.search.count(&payload.old_index).await?;
        let new_count = self.search.count(&payload.new_index).await?;
        if new_count < old_count {
            warn!(
                alias,
                old_count, new_count, "New index holds fewer documents, keeping old index"
            );
            ctx.report_progress(
                100,
                Some("Reindex complete; old index kept because the new index has fewer documents"),
            )
            .await;
            return Ok(());
        }

        self.search.delete_index(&payload.old_index).await?;
        ctx.report_progress(100, Some("Reindex complete; old index deleted"))
            .await;
        info!(alias, old_index = %payload.old_index, "Old index deleted");
        Ok(())
    }
}
