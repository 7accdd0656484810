use thiserror::Error;

/// Errors that can occur in the messaging layer
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("app {app_id} is not registered for topic {topic}")]
    UnregisteredTopic { app_id: String, topic: String },

    #[error("{kind} not found: {name}")]
    TopologyNotFound { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("topic {0} already has an active subscription")]
    AlreadySubscribed(String),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl MessagingError {
    /// Returns true if the error means the referenced exchange or queue does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MessagingError::TopologyNotFound { .. })
    }

    /// Returns true if the broker connection was unusable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MessagingError::BrokerUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
