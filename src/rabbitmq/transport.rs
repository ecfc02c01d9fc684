// src/rabbitmq/transport.rs
// Broker primitives the rest of the layer is written against.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};

use super::channel_manager::ChannelConfig;
use super::errors::Result;
use super::state::FailureSignal;
use crate::config::BrokerConfig;
use crate::message::Message;

/// Broker verdict on a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirm {
    Acked,
    /// Accepted, but no queue was bound for the routing key.
    Unroutable,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>>;

    /// Whether the transport can currently write to the socket.
    fn is_writable(&self) -> bool;

    /// Registers a signal to raise when the connection errors or closes unexpectedly.
    fn on_failure(&self, signal: FailureSignal);

    async fn close(&self) -> Result<()>;
}

/// A multiplexed session on a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Durable exchange declaration; idempotent for identical parameters.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str, durable: bool, arguments: FieldTable) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm>;

    /// Subscribes in manual-ack mode.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Returns the message to its queue carrying `retry_count` in its headers.
    async fn requeue(&self, message: &Message, retry_count: u32) -> Result<()>;

    /// Negative acknowledgement without requeue; the broker dead-letters it.
    async fn reject(&self) -> Result<()>;
}

pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acker>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;
