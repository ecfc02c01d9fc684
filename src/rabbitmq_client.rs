use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::rabbitmq::{
    ConnectionPool, ConnectionState, ConsumerOptions, ConsumerRegistry, HealthReporter,
    LapinTransport, MessageHandler, PublishOptions, Publisher, Reconnector, Result, Transport,
};

struct Monitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One connectivity-layer instance: pool, liveness monitor, publisher,
/// consumer registry and health reporter sharing the same pool state.
pub struct RabbitMQClient {
    pool: Arc<ConnectionPool>,
    publisher: Publisher,
    consumers: Arc<ConsumerRegistry>,
    reconnector: Arc<Reconnector>,
    health: HealthReporter,
    monitor: Mutex<Option<Monitor>>,
}

impl RabbitMQClient {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(config, transport));
        let consumers = Arc::new(ConsumerRegistry::new(pool.clone()));
        let reconnector = Arc::new(Reconnector::new(pool.clone(), consumers.clone()));

        Ok(Self {
            publisher: Publisher::new(pool.clone()),
            health: HealthReporter::new(pool.clone()),
            pool,
            consumers,
            reconnector,
            monitor: Mutex::new(None),
        })
    }

    pub fn with_lapin(config: BrokerConfig) -> Result<Self> {
        Self::new(config, Arc::new(LapinTransport))
    }

    /// Opens the pool and starts the liveness monitor.
    pub async fn connect(&self) -> Result<()> {
        self.pool.connect().await?;

        let mut monitor = self.monitor.lock().await;
        if monitor.is_none() {
            let (shutdown, receiver) = watch::channel(false);
            let handle = self.reconnector.clone().spawn(receiver);
            *monitor = Some(Monitor { shutdown, handle });
        }
        info!("RabbitMQ client connected");
        Ok(())
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        self.publisher.publish(exchange, routing_key, payload, options).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<()> {
        self.publisher
            .publish_json(exchange, routing_key, message, options)
            .await
    }

    pub async fn register_consumer<H>(&self, queue: &str, handler: H, options: ConsumerOptions) -> Result<()>
    where
        H: MessageHandler,
    {
        self.consumers.register(queue, handler, options).await
    }

    pub async fn health_check(&self) -> bool {
        self.health.check().await
    }

    /// Stops the liveness monitor, then closes channels and connections.
    pub async fn close(&self) -> Result<()> {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = &monitor {
            let _ = monitor.shutdown.send(true);
        }

        // Closing first moves the state to Disconnected, which also ends a
        // reconnect loop the monitor may be stuck in.
        self.pool.close().await?;

        if let Some(monitor) = monitor {
            if let Err(e) = monitor.handle.await {
                warn!("Liveness monitor ended abnormally: {}", e);
            }
        }
        info!("RabbitMQ client closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.pool.state().load()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    pub fn reconnector(&self) -> &Arc<Reconnector> {
        &self.reconnector
    }
}
