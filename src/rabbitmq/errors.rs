// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to RabbitMQ")]
    NotConnected,

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Request timed out after {0:?}")]
    TimeoutError(Duration),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("RabbitMQ protocol error: {0}")]
    ProtocolError(String),

    #[error("Consumer for queue `{0}` has not been started")]
    ConsumerNotStarted(String),

    #[error("Publisher `{0}` is not configured")]
    PublisherNotConfigured(String),

    #[error("Response channel was closed unexpectedly")]
    ResponseChannelClosed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("invalid connection state")
            || error_text.contains("invalid channel state")
        {
            RabbitMQError::NotConnected
        } else {
            RabbitMQError::ProtocolError(error_text)
        }
    }
}
