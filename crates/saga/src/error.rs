//! Saga error types.

use saga_store::SagaStoreError;
use thiserror::Error;

/// Error returned by a completion callback.
pub type CompletionError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while coordinating a saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The event type is not one the saga waits for. Never retried.
    #[error("event type '{event_type}' is not part of saga '{saga_name}'")]
    InvalidEventType {
        saga_name: String,
        event_type: String,
    },

    /// Concurrent writers kept conflicting on the same saga row.
    #[error("saga '{saga_name}' key '{saga_key}' still conflicting after {attempts} attempts")]
    StorageConflict {
        saga_name: String,
        saga_key: String,
        attempts: u32,
        source: SagaStoreError,
    },

    /// The completion callback failed; the saga was marked incomplete again
    /// so a redelivered event can complete it.
    #[error("completion of saga '{saga_name}' key '{saga_key}' failed: {source}")]
    CompletionFailed {
        saga_name: String,
        saga_key: String,
        source: CompletionError,
    },

    /// The completion callback failed and the saga could not be marked
    /// incomplete again. It stays completed and will not retry.
    #[error(
        "completion of saga '{saga_name}' key '{saga_key}' failed ({callback_error}) and could not be reverted: {source}"
    )]
    CompletionRollbackFailed {
        saga_name: String,
        saga_key: String,
        callback_error: String,
        source: SagaStoreError,
    },

    /// No saga key could be derived from the event.
    #[error("event '{event_type}' carries no saga key")]
    MissingSagaKey { event_type: String },

    /// The message payload is not an event.
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),

    /// Saga store error.
    #[error("saga store error: {0}")]
    Store(#[from] SagaStoreError),
}

impl SagaError {
    /// Returns true for conflicts that outlasted the local retry budget.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::StorageConflict { .. })
    }

    /// Returns true if the completion callback failed, whether or not the
    /// revert succeeded.
    pub fn is_completion_failure(&self) -> bool {
        matches!(
            self,
            SagaError::CompletionFailed { .. } | SagaError::CompletionRollbackFailed { .. }
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
