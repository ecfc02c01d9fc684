// src/rabbitmq/errors.rs

use lapin::protocol::AMQPErrorKind;
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Broker unreachable or credentials rejected while opening a connection.
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// Terminal publish failure, raised once every retry has been spent.
    #[error("RabbitMQ publish error after {attempts} attempt(s): {reason}")]
    PublishError { attempts: u32, reason: String },

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Connection pool is not available: {0}")]
    NotConnected(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors: channel-scoped failures stay channel errors,
// everything else takes the connection down.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::ChannelsLimitReached
            | LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_) => RabbitMQError::ChannelError(error_text),
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(_) => RabbitMQError::ChannelError(error_text),
                AMQPErrorKind::Hard(_) => RabbitMQError::ConnectionError(error_text),
            },
            _ => RabbitMQError::ConnectionError(error_text),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}
