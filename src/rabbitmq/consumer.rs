use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures_lite::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionPool;
use super::errors::{RabbitMQError, Result};
use super::state::ConnectionState;
use super::transport::{Delivery, DeliveryStream};
use crate::message::{Message, Outcome};

pub const DEAD_LETTER_SUFFIX: &str = "-dead-letter";

/// Business callback invoked for every delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Outcome;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Outcome {
        (self)(message).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Declare `<queue>-dead-letter` and bind it to the dead-letter exchange.
    pub declare_dead_letter_queue: bool,
    /// `(exchange, routing_key)` pairs the queue is bound to.
    pub bindings: Vec<(String, String)>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            declare_dead_letter_queue: true,
            bindings: Vec::new(),
        }
    }
}

impl ConsumerOptions {
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push((exchange.to_string(), routing_key.to_string()));
        self
    }
}

/// A queue subscription kept for the lifetime of the registry and re-applied
/// after every pool rebuild.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub queue: String,
    pub dlq_routing_key: String,
    pub options: ConsumerOptions,
    handler: Arc<dyn MessageHandler>,
}

impl ConsumerRegistration {
    pub fn new(queue: &str, handler: Arc<dyn MessageHandler>, options: ConsumerOptions) -> Self {
        Self {
            queue: queue.to_string(),
            dlq_routing_key: format!("{}{}", queue, DEAD_LETTER_SUFFIX),
            options,
            handler,
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue { retry_count: u32 },
    DeadLetter,
}

/// Maps a handler outcome and the message's current retry count to a settlement.
pub fn settle(outcome: &Outcome, retry_count: u32, max_retries: u32) -> Settlement {
    match outcome {
        Outcome::Ack => Settlement::Ack,
        Outcome::DeadLetter(_) => Settlement::DeadLetter,
        Outcome::Retry(_) => {
            let next = retry_count.saturating_add(1);
            if next <= max_retries {
                Settlement::Requeue { retry_count: next }
            } else {
                Settlement::DeadLetter
            }
        }
    }
}

/// Queue arguments routing rejected messages to the dead-letter exchange.
pub fn queue_arguments(dead_letter_exchange: &str, dlq_routing_key: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dead_letter_exchange.into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dlq_routing_key.into()),
    );
    arguments
}

/// Records consumer registrations and keeps them subscribed across reconnects.
pub struct ConsumerRegistry {
    pool: Arc<ConnectionPool>,
    registrations: Mutex<Vec<ConsumerRegistration>>,
    subscriptions: AtomicU64,
}

impl ConsumerRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            registrations: Mutex::new(Vec::new()),
            subscriptions: AtomicU64::new(0),
        }
    }

    /// Subscribes `handler` to `queue` and keeps the registration for replay.
    ///
    /// While a reconnect is in progress the registration is only recorded; the
    /// reconnector applies it once the new pool is up.
    pub async fn register<H>(&self, queue: &str, handler: H, options: ConsumerOptions) -> Result<()>
    where
        H: MessageHandler,
    {
        let registration = ConsumerRegistration::new(queue, Arc::new(handler), options);
        let mut registrations = self.registrations.lock().await;

        match self.pool.state().load() {
            ConnectionState::Connected => match self.subscribe(&registration).await {
                Ok(()) => {
                    registrations.push(registration);
                    Ok(())
                }
                // The pool went away mid-subscribe; the rebuild replays this registration.
                Err(e) if self.pool.state().load() == ConnectionState::Reconnecting => {
                    warn!(queue, "Subscribe interrupted by reconnect, deferring: {}", e);
                    registrations.push(registration);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ConnectionState::Reconnecting => {
                info!(queue, "Pool is reconnecting, consumer will subscribe after rebuild");
                registrations.push(registration);
                Ok(())
            }
            state => Err(RabbitMQError::NotConnected(format!(
                "cannot register consumer for '{}' while {:?}",
                queue, state
            ))),
        }
    }

    /// Re-subscribes every registration on the current pool, then runs `on_complete`
    /// before new registrations are admitted again.
    pub async fn replay<F>(&self, on_complete: F) -> usize
    where
        F: FnOnce() + Send,
    {
        let registrations = self.registrations.lock().await;
        let mut applied = 0;

        for registration in registrations.iter() {
            match self.subscribe(registration).await {
                Ok(()) => applied += 1,
                Err(e) => error!(queue = %registration.queue, "Failed to re-subscribe consumer: {}", e),
            }
        }

        on_complete();
        info!(applied, total = registrations.len(), "Consumers replayed");
        applied
    }

    pub async fn len(&self) -> usize {
        self.registrations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total successful subscribe calls, replays included.
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::Relaxed)
    }

    async fn subscribe(&self, registration: &ConsumerRegistration) -> Result<()> {
        let config = self.pool.config();
        let channel = self.pool.select_channel()?;
        let queue = registration.queue.as_str();

        channel
            .declare_queue(
                queue,
                true,
                queue_arguments(&config.dead_letter_exchange, &registration.dlq_routing_key),
            )
            .await?;

        if registration.options.declare_dead_letter_queue {
            let dlq = registration.dlq_routing_key.as_str();
            channel.declare_queue(dlq, true, FieldTable::default()).await?;
            channel
                .bind_queue(dlq, &config.dead_letter_exchange, dlq)
                .await?;
        }

        for (exchange, routing_key) in &registration.options.bindings {
            channel.declare_exchange(exchange, ExchangeKind::Direct).await?;
            channel.bind_queue(queue, exchange, routing_key).await?;
        }

        let consumer_tag = format!("{}-{}", queue, &Uuid::new_v4().to_string()[..8]);
        let stream = channel.consume(queue, &consumer_tag).await?;

        info!(queue, consumer_tag = %consumer_tag, channel_id = %channel.id(), "Started consuming");
        self.subscriptions.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(dispatch(
            stream,
            registration.handler.clone(),
            config.retry_attempts,
            registration.queue.clone(),
        ));
        Ok(())
    }
}

async fn dispatch(
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    max_retries: u32,
    queue: String,
) {
    while let Some(delivery_result) = stream.next().await {
        match delivery_result {
            Ok(delivery) => {
                dispatch_one(delivery, handler.as_ref(), max_retries).await;
            }
            Err(e) => {
                error!(queue = %queue, "Error receiving message: {}", e);
            }
        }
    }
    warn!(queue = %queue, "Delivery stream ended, consumer stopped until the pool is rebuilt");
}

/// Runs the handler for one delivery and settles it.
pub async fn dispatch_one(delivery: Delivery, handler: &dyn MessageHandler, max_retries: u32) -> Settlement {
    let Delivery { message, acker } = delivery;
    let retry_count = message.retry_count();

    let outcome = AssertUnwindSafe(handler.handle(message.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(routing_key = %message.routing_key, retry_count, "Message handler panicked");
            Outcome::Retry("handler panicked".to_string())
        });
    let settlement = settle(&outcome, retry_count, max_retries);

    let result = match (&outcome, settlement) {
        (_, Settlement::Ack) => acker.ack().await,
        (Outcome::Retry(reason), Settlement::Requeue { retry_count }) => {
            warn!(routing_key = %message.routing_key, retry_count, "Handler failed, requeueing: {}", reason);
            acker.requeue(&message, retry_count).await
        }
        (outcome, _) => {
            error!(routing_key = %message.routing_key, retry_count, ?outcome, "Dead-lettering message");
            acker.reject().await
        }
    };

    if let Err(e) = result {
        error!(routing_key = %message.routing_key, ?settlement, "Failed to settle message: {}", e);
    }
    settlement
}
