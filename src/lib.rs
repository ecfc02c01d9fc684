//! Reliability layer between business code and a RabbitMQ broker: a pool of
//! connections, heartbeat-driven reconnects, retrying publishes, and consumers
//! with manual acknowledgement and dead-lettering.

pub mod config;
mod env;
pub mod message;
pub mod rabbitmq;
mod rabbitmq_client;

pub use config::BrokerConfig;
pub use message::{Message, Outcome, RETRY_COUNT_HEADER};
pub use rabbitmq::{ConsumerOptions, PublishOptions, RabbitMQError, Result};
pub use rabbitmq_client::RabbitMQClient;
