//! Service startup errors.

use messaging::MessagingError;
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that stop the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("saga store error: {0}")]
    Store(#[from] SagaStoreError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker connection was lost and could not be restored.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
