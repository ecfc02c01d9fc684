// src/rabbitmq/mod.rs
// Connection pool, liveness monitor, publisher, consumer registry and health
// reporting on top of a pluggable broker transport.

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod health;
pub mod publisher;
pub mod reconnector;
pub mod retry;
pub mod state;
pub mod transport;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinTransport;
pub use channel_manager::ChannelConfig;
pub use connection::{ConnectionPool, PoolEntry, PoolGeneration};
pub use consumer::{ConsumerOptions, ConsumerRegistry, MessageHandler, Settlement};
pub use errors::{RabbitMQError, Result};
pub use health::HealthReporter;
pub use publisher::{PublishOptions, Publisher};
pub use reconnector::Reconnector;
pub use retry::{Backoff, RetryPolicy};
pub use state::{ConnectionState, FailureSignal};
pub use transport::{
    Acker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, PublishConfirm, Transport,
};
