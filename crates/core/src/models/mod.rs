//! Domain models touched by maintenance work items.

mod event;
mod organization;

pub use event::{Location, PersistentEvent, Stack, event_types};
pub use organization::{Organization, Project, UsageInfo, User, plans};

/// One page of a paginated repository query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total number of matching items across all pages.
    pub total: u64,
    /// Whether another page follows this one.
    pub has_more: bool,
}

impl<T> Page<T> {
    /// An empty, final page.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            has_more: false,
        }
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    #[must_use]
    pub const fn new(page: usize, limit: usize) -> Self {
        Self { page, limit }
    }

    /// Number of items skipped before this page.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.limit
    }
}
