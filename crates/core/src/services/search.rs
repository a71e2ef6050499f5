//! Search index port.
//!
//! Mirrors the subset of a document store's API that index migration needs:
//! scrolling, bulk and single writes, counting, and atomic alias swaps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_common::AppResult;
use serde::{Deserialize, Serialize};

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub source: serde_json::Value,
}

impl SearchDocument {
    #[must_use]
    pub fn new(id: impl Into<String>, source: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

/// Filter applied while scrolling an index.
#[derive(Debug, Clone, Default)]
pub struct ScrollQuery {
    /// Only documents whose `time_field` is at or after this instant.
    pub modified_since: Option<DateTime<Utc>>,
    /// Document field holding the last-modified timestamp.
    pub time_field: String,
}

impl ScrollQuery {
    /// Match every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn modified_since(time_field: &str, since: DateTime<Utc>) -> Self {
        Self {
            modified_since: Some(since),
            time_field: time_field.to_string(),
        }
    }
}

/// One batch of a scroll.
#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub documents: Vec<SearchDocument>,
    /// Cursor for the next batch; `None` once the scroll is exhausted.
    pub cursor: Option<String>,
}

/// A document the bulk endpoint rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemFailure {
    pub id: String,
    pub reason: String,
}

/// Per-item result of a bulk write that was accepted as a whole.
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub failed: Vec<BulkItemFailure>,
}

impl BulkResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait SearchIndexClient: Send + Sync {
    async fn index_exists(&self, index: &str) -> AppResult<bool>;

    async fn count(&self, index: &str) -> AppResult<u64>;

    /// Read the next batch of documents. Pass the previous page's cursor to
    /// continue, `None` to start from the beginning.
    async fn scroll(
        &self,
        index: &str,
        query: &ScrollQuery,
        cursor: Option<&str>,
        size: usize,
    ) -> AppResult<ScrollPage>;

    /// Write many documents at once. `Err` means the request was rejected
    /// wholesale; item level rejections come back in the response.
    async fn bulk_index(&self, index: &str, documents: &[SearchDocument])
    -> AppResult<BulkResponse>;

    /// Write a single document, replacing any document with the same id.
    async fn index_document(&self, index: &str, document: &SearchDocument) -> AppResult<()>;

    /// The index an alias currently points at.
    async fn alias_target(&self, alias: &str) -> AppResult<Option<String>>;

    /// Atomically repoint `alias` from `from` to `to`.
    async fn swap_alias(&self, alias: &str, from: Option<&str>, to: &str) -> AppResult<()>;

    async fn delete_index(&self, index: &str) -> AppResult<()>;
}
