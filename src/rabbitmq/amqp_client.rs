// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker as LapinAcker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::channel_manager::ChannelConfig;
use super::errors::{RabbitMQError, Result};
use super::state::FailureSignal;
use super::transport::{
    Acker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, PublishConfirm, Transport,
};
use crate::config::BrokerConfig;
use crate::message::{with_retry_count, Message};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>> {
        debug!(uri = %config.redacted_uri(), "Opening AMQP connection");

        let connection = timeout(
            config.connect_timeout(),
            Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default()),
        )
        .await?
        .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self, config: &ChannelConfig) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        debug!("Setting channel QoS to {}", config.prefetch_count);
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;

        if config.confirm_mode {
            debug!("Enabling confirm mode for channel {}", config.id);
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        info!("Channel {} created and configured successfully", config.id);
        Ok(Arc::new(AmqpChannel {
            channel,
            id: config.id.clone(),
        }))
    }

    fn is_writable(&self) -> bool {
        self.connection.status().connected()
    }

    fn on_failure(&self, signal: FailureSignal) {
        self.connection.on_error(move |err| {
            warn!("RabbitMQ connection error: {}", err);
            signal.raise(&err.to_string());
        });
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "Closing connection").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
    id: String,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to declare exchange {}: {}", name, e))
            })
    }

    async fn declare_queue(&self, name: &str, durable: bool, arguments: FieldTable) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare queue {}: {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to bind queue {}: {}", queue, e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm> {
        publish_on(&self.channel, exchange, routing_key, payload, properties).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let channel = self.channel.clone();
        let queue = queue.to_string();
        let stream = consumer.map(move |delivery_result| {
            delivery_result
                .map(|delivery| {
                    let acker = AmqpAcker {
                        acker: delivery.acker.clone(),
                        channel: channel.clone(),
                        queue: queue.clone(),
                    };
                    Delivery {
                        message: Message {
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            payload: delivery.data,
                            properties: delivery.properties,
                            redelivered: delivery.redelivered,
                        },
                        acker: Box::new(acker),
                    }
                })
                .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "Closing channel").await?;
        }
        Ok(())
    }
}

async fn publish_on(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    properties: BasicProperties,
) -> Result<PublishConfirm> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: true,
                ..BasicPublishOptions::default()
            },
            payload,
            properties,
        )
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("basic.publish failed: {}", e)))?
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("publisher confirm failed: {}", e)))?;

    match confirm {
        Confirmation::Ack(None) => Ok(PublishConfirm::Acked),
        Confirmation::Ack(Some(_)) => Ok(PublishConfirm::Unroutable),
        Confirmation::NotRequested => Ok(PublishConfirm::NotRequested),
        Confirmation::Nack(_) => Err(RabbitMQError::ChannelError(
            "broker negatively acknowledged the message".to_string(),
        )),
    }
}

/// Settles lapin deliveries. Requeueing republishes the message to its queue
/// with the new retry count, since a plain nack cannot rewrite headers.
struct AmqpAcker {
    acker: LapinAcker,
    channel: Channel,
    queue: String,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn requeue(&self, message: &Message, retry_count: u32) -> Result<()> {
        let properties = message
            .properties
            .clone()
            .with_headers(with_retry_count(message.headers(), retry_count));

        match publish_on(&self.channel, "", &self.queue, &message.payload, properties).await {
            Ok(_) => self.ack().await,
            Err(e) => {
                warn!(queue = %self.queue, "Republish for retry failed, falling back to nack: {}", e);
                self.acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| RabbitMQError::AckError(e.to_string()))
            }
        }
    }

    async fn reject(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
