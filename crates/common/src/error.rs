//! Error types for faultline.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
///
/// The first group of variants is the work-item taxonomy the dispatcher
/// routes on; the second group wraps failures of external collaborators.
#[derive(Debug, Error)]
pub enum AppError {
    // === Work-item taxonomy ===
    #[error("Timed out acquiring lock: {key}")]
    LockTimeout { key: String },

    #[error("Lock lost: {key}")]
    LockLost { key: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{} document(s) could not be written: {}", .failed_ids.len(), .failed_ids.join(", "))]
    PartialBatchFailure { failed_ids: Vec<String> },

    #[error("Work item cancelled")]
    Cancelled,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No handler registered for work item type: {0}")]
    UnknownWorkItemType(String),

    // === Collaborator Errors ===
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Geo lookup error: {0}")]
    GeoLookup(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the error code used in logs and status messages.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PartialBatchFailure { .. } => "PARTIAL_BATCH_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::Decode(_) => "DECODE_ERROR",
            Self::UnknownWorkItemType(_) => "UNKNOWN_WORK_ITEM_TYPE",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Search(_) => "SEARCH_ERROR",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::Mail(_) => "MAIL_ERROR",
            Self::Billing(_) => "BILLING_ERROR",
            Self::GeoLookup(_) => "GEO_LOOKUP_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error is expected to clear up on redelivery
    /// and should not be surfaced to an operator on first occurrence.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::LockLost { .. } | Self::Cancelled
        )
    }

    /// Returns whether redelivering the work item cannot change the outcome.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PartialBatchFailure { .. } | Self::Decode(_) | Self::UnknownWorkItemType(_)
        )
    }
}

// === From implementations ===

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(AppError::LockTimeout { key: "k".into() }.is_transient());
        assert!(AppError::LockLost { key: "k".into() }.is_transient());
        assert!(AppError::Cancelled.is_transient());
        assert!(!AppError::NotFound("org".into()).is_transient());
        assert!(!AppError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn test_terminal_errors() {
        let err = AppError::PartialBatchFailure {
            failed_ids: vec!["a".into(), "b".into()],
        };
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "2 document(s) could not be written: a, b");
        assert!(AppError::Decode("bad".into()).is_terminal());
        assert!(!AppError::Redis("down".into()).is_terminal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            AppError::LockTimeout { key: "k".into() }.error_code(),
            "LOCK_TIMEOUT"
        );
        assert_eq!(
            AppError::UnknownWorkItemType("x".into()).error_code(),
            "UNKNOWN_WORK_ITEM_TYPE"
        );
    }

    #[test]
    fn test_from_serde_error_is_decode() {
        let err: AppError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, AppError::Decode(_)));
    }
}
