use std::sync::Arc;

use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionPool;
use super::errors::{RabbitMQError, Result};
use super::retry::RetryPolicy;
use super::transport::PublishConfirm;
use crate::message::{header_u32, with_retry_count, RETRY_COUNT_HEADER};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Extra headers; an `x-retry-count` here seeds the retry counter.
    pub headers: Option<FieldTable>,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            headers: None,
            persistent: true,
            content_type: None,
            message_id: None,
        }
    }
}

/// Publishes through the pool with bounded retry.
pub struct Publisher {
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let policy = pool.config().retry_policy();
        Self { pool, policy }
    }

    /// Publishes `payload`, retrying up to `retry_attempts` times after the first try.
    ///
    /// Every attempt carries `x-retry-count` = seed + attempt number. A message the
    /// broker accepts but cannot route counts as published.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        let seed = options
            .headers
            .as_ref()
            .and_then(|headers| header_u32(headers, RETRY_COUNT_HEADER))
            .unwrap_or(0);
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut retry = 0;
        loop {
            let properties = self.properties(options, &message_id, seed.saturating_add(retry));

            match self.try_publish(exchange, routing_key, payload, properties).await {
                Ok(PublishConfirm::Unroutable) => {
                    warn!(exchange, routing_key, message_id = %message_id, "Message published but unroutable");
                    return Ok(());
                }
                Ok(confirm) => {
                    debug!(exchange, routing_key, message_id = %message_id, ?confirm, "Message published");
                    return Ok(());
                }
                Err(e) if retry < self.policy.attempts => {
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        exchange,
                        routing_key,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying: {}",
                        e
                    );
                    sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    error!(exchange, routing_key, attempts = retry + 1, "Publish failed: {}", e);
                    return Err(RabbitMQError::PublishError {
                        attempts: retry + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Serializes `message` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let mut options = options.clone();
        if options.content_type.is_none() {
            options.content_type = Some("application/json".to_string());
        }
        self.publish(exchange, routing_key, &payload, &options).await
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirm> {
        let channel = self.pool.select_channel()?;

        // The default exchange cannot be declared.
        if !exchange.is_empty() {
            channel.declare_exchange(exchange, ExchangeKind::Direct).await?;
        }

        let confirm = channel
            .publish(exchange, routing_key, payload, properties)
            .await?;
        info!(exchange, routing_key, channel_id = %channel.id(), "Published message");
        Ok(confirm)
    }

    fn properties(&self, options: &PublishOptions, message_id: &str, retry_count: u32) -> BasicProperties {
        let delivery_mode = if options.persistent { PERSISTENT } else { TRANSIENT };

        let mut properties = BasicProperties::default()
            .with_message_id(message_id.into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_delivery_mode(delivery_mode)
            .with_headers(with_retry_count(options.headers.as_ref(), retry_count));

        if let Some(content_type) = &options.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        properties
    }
}
