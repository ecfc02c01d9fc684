use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use lapin::types::FieldTable;
use tokio::time::timeout;
use tracing::{debug, error};

use super::connection::{ConnectionPool, PoolGeneration};
use super::errors::{RabbitMQError, Result};
use super::state::ConnectionState;

pub struct HealthReporter {
    pool: Arc<ConnectionPool>,
}

impl HealthReporter {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// `true` only if the pool is connected, every connection is writable and every
    /// channel can still assert the sentinel queue. Never fails or panics.
    pub async fn check(&self) -> bool {
        if self.pool.state().load() != ConnectionState::Connected {
            return false;
        }
        let Some(generation) = self.pool.snapshot() else {
            return false;
        };

        let checks = AssertUnwindSafe(self.check_generation(&generation)).catch_unwind();
        match timeout(self.pool.config().connect_timeout(), checks).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                error!(generation = generation.id, "Health check failed: {}", e);
                false
            }
            Ok(Err(_)) => {
                error!(generation = generation.id, "Health check panicked");
                false
            }
            Err(_) => {
                error!(generation = generation.id, "Health check timed out");
                false
            }
        }
    }

    async fn check_generation(&self, generation: &PoolGeneration) -> Result<()> {
        let sentinel = &self.pool.config().health_check_queue;

        for (slot, entry) in generation.entries.iter().enumerate() {
            if !entry.connection.is_writable() {
                return Err(RabbitMQError::ConnectionError(format!(
                    "connection {} is not writable",
                    slot
                )));
            }
            entry
                .channel
                .declare_queue(sentinel, false, FieldTable::default())
                .await?;
        }

        debug!(generation = generation.id, "Health check passed");
        Ok(())
    }
}
