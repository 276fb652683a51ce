//! Error types for the memory lifecycle engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by tier store adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The requested item does not exist in the tier.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The backend could not be reached or failed mid-operation.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The write conflicts with the current state of the item.
    #[error("Store conflict on {id}: {reason}")]
    Conflict { id: String, reason: String },
}

impl StoreError {
    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Whether this error means the item is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors reported by the external reasoning provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider could not be reached or refused the call.
    #[error("Reasoning provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with something that could not be used.
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// A single call exceeded its deadline.
    #[error("Provider call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The circuit breaker is open and calls are short-circuited.
    #[error("Provider circuit breaker is open")]
    CircuitOpen,
}

impl ProviderError {
    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }
}

/// Per-item error detail carried inside a batch failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    /// Identifier of the fact, cluster or group that failed
    pub item: String,
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.item, self.kind, self.message)
    }
}

/// Errors that can occur during lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// CIAR inputs outside their domain
    #[error("Invalid score input: {field} = {value}")]
    InvalidScoreInput { field: &'static str, value: f64 },

    /// Tier store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reasoning provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Some items of a batch failed
    #[error("Partial batch failure: {failed} of {attempted} items failed")]
    PartialBatchFailure {
        attempted: usize,
        failed: usize,
        errors: Vec<ItemError>,
    },

    /// Dual-index write left one representation behind
    #[error("Inconsistent index state for episode {episode_id}: {detail}")]
    InconsistentIndexState { episode_id: String, detail: String },

    /// Dual-index write rolled back cleanly but never committed
    #[error("Index write for episode {episode_id} failed after {attempts} attempts: {last_error}")]
    IndexWriteFailed {
        episode_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Another batch of the same engine holds the scope
    #[error("{engine} batch already in progress for scope {scope}")]
    BatchInProgress { engine: String, scope: String },

    /// The batch was cancelled before this unit of work ran
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Create an invalid score input error.
    pub fn invalid_score_input(field: &'static str, value: f64) -> Self {
        Self::InvalidScoreInput { field, value }
    }

    /// Create an inconsistent index state error.
    pub fn inconsistent_index(episode_id: impl ToString, detail: impl Into<String>) -> Self {
        Self::InconsistentIndexState {
            episode_id: episode_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Create a batch-in-progress error.
    pub fn batch_in_progress(engine: impl ToString, scope: impl ToString) -> Self {
        Self::BatchInProgress {
            engine: engine.to_string(),
            scope: scope.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidScoreInput { .. } => ErrorKind::InvalidScoreInput,
            Self::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Store(StoreError::Connection(_)) => ErrorKind::ConnectionError,
            Self::Store(StoreError::Conflict { .. }) => ErrorKind::ConflictError,
            Self::Provider(ProviderError::MalformedResponse(_)) => ErrorKind::MalformedResponse,
            Self::Provider(ProviderError::Timeout { .. }) => ErrorKind::Timeout,
            Self::Provider(_) => ErrorKind::ProviderUnavailable,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Self::InconsistentIndexState { .. } => ErrorKind::InconsistentIndexState,
            Self::IndexWriteFailed { .. } => ErrorKind::IndexWriteFailed,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::BatchInProgress { .. } => ErrorKind::BatchInProgress,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Convert into a per-item error record.
    pub fn to_item_error(&self, item: impl ToString) -> ItemError {
        ItemError {
            item: item.to_string(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Copyable classification of [`Error`], used in batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidScoreInput,
    NotFound,
    ConnectionError,
    ConflictError,
    ProviderUnavailable,
    MalformedResponse,
    Timeout,
    PartialBatchFailure,
    InconsistentIndexState,
    IndexWriteFailed,
    InvalidConfiguration,
    BatchInProgress,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidScoreInput => "invalid_score_input",
            Self::NotFound => "not_found",
            Self::ConnectionError => "connection_error",
            Self::ConflictError => "conflict_error",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::Timeout => "timeout",
            Self::PartialBatchFailure => "partial_batch_failure",
            Self::InconsistentIndexState => "inconsistent_index_state",
            Self::IndexWriteFailed => "index_write_failed",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::BatchInProgress => "batch_in_progress",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_kinds() {
        let err: Error = StoreError::not_found("fact", "abc").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "fact not found: abc");

        let err: Error = StoreError::connection("refused").into();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);

        let err: Error = StoreError::conflict("abc", "already superseded").into();
        assert_eq!(err.kind(), ErrorKind::ConflictError);
    }

    #[test]
    fn test_provider_error_kinds() {
        let err: Error = ProviderError::Unavailable("503".into()).into();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);

        let err: Error = ProviderError::Timeout { duration_ms: 10 }.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        assert!(!ProviderError::CircuitOpen.is_retryable());
        assert!(ProviderError::MalformedResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_item_error_record() {
        let err = Error::inconsistent_index("ep-1", "vector delete failed");
        let item = err.to_item_error("cluster-0");
        assert_eq!(item.kind, ErrorKind::InconsistentIndexState);
        assert_eq!(item.item, "cluster-0");
        assert!(item.message.contains("ep-1"));
    }
}
