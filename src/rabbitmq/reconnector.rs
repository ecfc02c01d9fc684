// src/rabbitmq/reconnector.rs
// Liveness monitor: detects a dead pool and rebuilds it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection::ConnectionPool;
use super::consumer::ConsumerRegistry;
use super::retry::RetryPolicy;
use super::state::ConnectionState;

pub struct Reconnector {
    pool: Arc<ConnectionPool>,
    consumers: Arc<ConsumerRegistry>,
    policy: RetryPolicy,
    cycles: AtomicU64,
}

impl Reconnector {
    pub fn new(pool: Arc<ConnectionPool>, consumers: Arc<ConsumerRegistry>) -> Self {
        let policy = pool.config().retry_policy();
        Self {
            pool,
            consumers,
            policy,
            cycles: AtomicU64::new(0),
        }
    }

    /// Half the heartbeat interval.
    pub fn poll_interval(&self) -> Duration {
        (self.pool.config().heartbeat_interval() / 2).max(Duration::from_millis(1))
    }

    /// Number of reconnect cycles that acquired the guard.
    pub fn reconnect_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Runs the monitor until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_ms = self.poll_interval().as_millis() as u64, "Liveness monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.pool.failures().notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.check().await;
        }
        info!("Liveness monitor stopped");
    }

    /// One liveness check. Returns `true` if it ran a reconnect cycle.
    pub async fn check(&self) -> bool {
        if self.pool.state().load() != ConnectionState::Connected {
            return false;
        }

        if self.pool.failures().take() {
            return self.reconnect("connection error or close signalled").await;
        }

        let writable = self
            .pool
            .snapshot()
            .is_some_and(|generation| generation.all_writable());
        if writable {
            self.pool.clock().touch();
            return false;
        }

        let heartbeat = self.pool.config().heartbeat_interval();
        if self.pool.clock().is_stale(heartbeat) {
            let since = self.pool.clock().since_last();
            return self
                .reconnect(&format!("no heartbeat for {}ms", since.as_millis()))
                .await;
        }

        debug!("Pool not writable, heartbeat not yet stale");
        false
    }

    /// Tears the pool down and rebuilds it, unless another cycle is already running.
    ///
    /// Retries the rebuild until it succeeds or the pool is closed. Returns `true`
    /// only if this call installed a new pool.
    pub async fn reconnect(&self, reason: &str) -> bool {
        if !self
            .pool
            .state()
            .compare_and_set(ConnectionState::Connected, ConnectionState::Reconnecting)
        {
            debug!(reason, "Reconnect already in progress or pool not connected");
            return false;
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        warn!(reason, "Rebuilding connection pool");

        if let Some(old) = self.pool.detach() {
            old.close().await;
        }

        let mut attempt: u32 = 0;
        loop {
            sleep(self.policy.delay_for(attempt)).await;
            attempt = attempt.saturating_add(1);

            if self.abandoned() {
                return false;
            }

            match self.pool.open_generation().await {
                Ok(generation) => {
                    let id = generation.id;
                    if let Err(generation) =
                        self.pool.install_if(ConnectionState::Reconnecting, generation)
                    {
                        info!(generation = id, "Pool closed during reconnect, discarding rebuilt pool");
                        generation.close().await;
                        return false;
                    }
                    self.pool.clock().touch();

                    let pool = &self.pool;
                    self.consumers
                        .replay(|| {
                            pool.state()
                                .compare_and_set(ConnectionState::Reconnecting, ConnectionState::Connected);
                        })
                        .await;

                    info!(generation = id, attempt, "Connection pool rebuilt");
                    return true;
                }
                Err(e) => {
                    error!(attempt, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    fn abandoned(&self) -> bool {
        if self.pool.state().load() != ConnectionState::Reconnecting {
            info!("Pool closed during reconnect, giving up");
            return true;
        }
        false
    }
}
