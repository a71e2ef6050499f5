use serde::{Deserialize, Serialize};

use super::WorkItem;

const fn default_true() -> bool {
    true
}

fn default_time_field() -> String {
    "updated_utc".to_string()
}

/// Migrate the documents behind an alias into a new index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexWorkItem {
    pub alias: String,
    pub old_index: String,
    pub new_index: String,
    /// Last-modified field used to find documents written during the copy.
    #[serde(default = "default_time_field")]
    pub time_field: String,
    /// Delete the old index once the new one holds at least as many documents.
    #[serde(default = "default_true")]
    pub delete_old: bool,
}

impl ReindexWorkItem {
    #[must_use]
    pub fn new(
        alias: impl Into<String>,
        old_index: impl Into<String>,
        new_index: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            old_index: old_index.into(),
            new_index: new_index.into(),
            time_field: default_time_field(),
            delete_old: true,
        }
    }
}

impl WorkItem for ReindexWorkItem {
    const TYPE: &'static str = "reindex";
}
