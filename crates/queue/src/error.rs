//! Queue error type.

use meetq_common::AppError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors returned by queue components.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No dispatcher route exists for the task type.
    #[error("no route registered for task type: {0}")]
    Unroutable(String),

    /// No handler is registered for the message type.
    #[error("no handler registered for message type: {0}")]
    NoHandler(String),

    /// The item could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bounded queue rejected the item.
    #[error("{0} is full")]
    Full(&'static str),

    /// The component has been stopped and accepts no more work.
    #[error("{0} is stopped")]
    Stopped(&'static str),

    /// The component is not running.
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    /// Kafka client failed.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Component configuration is invalid or refers to a disabled component.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The referenced task or session does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The global manager was already installed.
    #[error("queue manager already initialized")]
    AlreadyInitialized,
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Redis(e) => Self::Redis(e.to_string()),
            #[cfg(feature = "kafka")]
            QueueError::Kafka(e) => Self::Kafka(e.to_string()),
            QueueError::Config(msg) => Self::Config(msg),
            other => Self::Queue(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            QueueError::Unroutable("recording".into()).to_string(),
            "no route registered for task type: recording"
        );
        assert_eq!(
            QueueError::Full("event queue").to_string(),
            "event queue is full"
        );
    }

    #[test]
    fn test_app_error_conversion() {
        let app: AppError = QueueError::Config("pubsub disabled".into()).into();
        assert!(matches!(app, AppError::Config(_)));

        let app: AppError = QueueError::Stopped("event bus").into();
        assert!(matches!(app, AppError::Queue(_)));
    }
}
