use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use lapin::ExchangeKind;
use tracing::{debug, error, info, warn};

use super::channel_manager::{ChannelConfig, ChannelSelector};
use super::errors::{RabbitMQError, Result};
use super::state::{AtomicState, ConnectionState, FailureSignal, HeartbeatClock};
use super::transport::{BrokerChannel, BrokerConnection, Transport};
use crate::config::BrokerConfig;

/// One pooled connection and the channel opened on it.
pub struct PoolEntry {
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
}

/// A batch of entries opened together and torn down together.
pub struct PoolGeneration {
    pub id: u64,
    pub entries: Vec<PoolEntry>,
}

impl PoolGeneration {
    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    pub fn all_writable(&self) -> bool {
        self.entries.iter().all(|entry| entry.connection.is_writable())
    }

    /// Closes every channel, then every connection. Failures are logged, not returned.
    pub async fn close(&self) {
        close_entries(self.id, &self.entries).await;
    }
}

async fn close_entries(generation: u64, entries: &[PoolEntry]) {
    for entry in entries {
        if let Err(e) = entry.channel.close().await {
            warn!(generation, channel_id = %entry.channel.id(), "Failed to close channel: {}", e);
        }
    }
    for (slot, entry) in entries.iter().enumerate() {
        if let Err(e) = entry.connection.close().await {
            warn!(generation, slot, "Failed to close connection: {}", e);
        }
    }
}

/// Owns the pooled (connection, channel) pairs of one connectivity-layer instance.
///
/// The current generation sits behind a single handle that is swapped, never
/// mutated, so callers of [`ConnectionPool::select_channel`] only ever see a
/// complete pool or none.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    current: RwLock<Option<Arc<PoolGeneration>>>,
    state: AtomicState,
    clock: HeartbeatClock,
    failures: FailureSignal,
    selector: ChannelSelector,
    generations: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            current: RwLock::new(None),
            state: AtomicState::new(ConnectionState::Disconnected),
            clock: HeartbeatClock::new(),
            failures: FailureSignal::new(),
            selector: ChannelSelector::new(),
            generations: AtomicU64::new(0),
        }
    }

    /// Opens the full pool and marks it connected.
    pub async fn connect(&self) -> Result<()> {
        if !self
            .state
            .compare_and_set(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(RabbitMQError::ConnectionError(format!(
                "pool is already {:?}",
                self.state.load()
            )));
        }

        info!(
            uri = %self.config.redacted_uri(),
            pool_size = self.config.connection_pool_size,
            "Connecting to RabbitMQ"
        );

        let generation = match self.open_generation().await {
            Ok(generation) => generation,
            Err(e) => {
                self.state
                    .compare_and_set(ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(generation) = self.install_if(ConnectionState::Connecting, generation) {
            generation.close().await;
            return Err(RabbitMQError::NotConnected(
                "pool was closed while connecting".to_string(),
            ));
        }
        self.clock.touch();
        self.state
            .compare_and_set(ConnectionState::Connecting, ConnectionState::Connected);
        Ok(())
    }

    /// Opens `connection_pool_size` connections with one channel each.
    ///
    /// Any failure closes whatever was opened so far and returns the error.
    pub async fn open_generation(&self) -> Result<Arc<PoolGeneration>> {
        let id = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = Vec::with_capacity(self.config.connection_pool_size);

        for slot in 0..self.config.connection_pool_size {
            match self.open_entry(id, slot).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!(generation = id, slot, "Failed to open pool entry: {}", e);
                    close_entries(id, &entries).await;
                    return Err(e);
                }
            }
        }

        if let Some(first) = entries.first() {
            if let Err(e) = first
                .channel
                .declare_exchange(&self.config.dead_letter_exchange, ExchangeKind::Direct)
                .await
            {
                error!(generation = id, "Failed to declare dead-letter exchange: {}", e);
                close_entries(id, &entries).await;
                return Err(e);
            }
        }

        for entry in &entries {
            entry.connection.on_failure(self.failures.clone());
        }

        info!(generation = id, connections = entries.len(), "Connection pool opened");
        Ok(Arc::new(PoolGeneration { id, entries }))
    }

    async fn open_entry(&self, generation: u64, slot: usize) -> Result<PoolEntry> {
        let connection = self.transport.connect(&self.config).await?;

        let channel_config = ChannelConfig::for_slot(
            self.config.prefetch_count,
            self.config.confirm_mode,
            generation,
            slot,
        );
        match connection.create_channel(&channel_config).await {
            Ok(channel) => {
                debug!(channel_id = %channel.id(), prefetch = channel_config.prefetch_count, "Channel ready");
                Ok(PoolEntry { connection, channel })
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(generation, slot, "Failed to close connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Makes `generation` the current pool if the state is still `expected`, and
    /// forgets failures raised before it.
    ///
    /// The state is checked under the same lock `close` takes, so a pool closed
    /// concurrently is never repopulated. A refused generation is handed back to
    /// the caller to close.
    pub fn install_if(
        &self,
        expected: ConnectionState,
        generation: Arc<PoolGeneration>,
    ) -> std::result::Result<(), Arc<PoolGeneration>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if self.state.load() != expected {
            warn!(
                generation = generation.id,
                state = ?self.state.load(),
                "Refusing to install pool generation"
            );
            return Err(generation);
        }
        *current = Some(generation);
        self.failures.clear();
        Ok(())
    }

    /// Removes the current pool so no new caller can select from it.
    pub fn detach(&self) -> Option<Arc<PoolGeneration>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn snapshot(&self) -> Option<Arc<PoolGeneration>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Closes all channels then all connections. Individual close errors are only logged.
    pub async fn close(&self) -> Result<()> {
        let detached = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            self.state.store(ConnectionState::Disconnected);
            current.take()
        };
        if let Some(generation) = detached {
            info!(generation = generation.id, "Closing connection pool");
            generation.close().await;
        }
        Ok(())
    }

    /// Picks a pooled channel in rotation, skipping channels that report closed.
    ///
    /// Consecutive calls may return different channels, so two publishes from the
    /// same caller are not ordered relative to each other.
    pub fn select_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let generation = self.snapshot().ok_or_else(|| {
            RabbitMQError::NotConnected(format!("pool is {:?}", self.state.load()))
        })?;

        self.selector
            .rotation(generation.entries.len())
            .map(|slot| &generation.entries[slot].channel)
            .find(|channel| channel.is_open())
            .cloned()
            .ok_or_else(|| {
                RabbitMQError::ChannelError(format!(
                    "every channel in pool generation {} is closed",
                    generation.id
                ))
            })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> &AtomicState {
        &self.state
    }

    pub fn clock(&self) -> &HeartbeatClock {
        &self.clock
    }

    pub fn failures(&self) -> &FailureSignal {
        &self.failures
    }

    pub fn connection_count(&self) -> usize {
        self.snapshot().map_or(0, |generation| generation.connection_count())
    }
}
