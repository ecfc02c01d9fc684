// src/rabbitmq/state.rs
// Shared liveness state: pool lifecycle, heartbeat clock and failure signalling.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Atomic cell holding a [`ConnectionState`].
///
/// The transition into `Reconnecting` goes through [`AtomicState::compare_and_set`],
/// which makes it the single in-flight guard for reconnect cycles.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `current` to `next` only if the cell still holds `current`.
    pub fn compare_and_set(&self, current: ConnectionState, next: ConnectionState) -> bool {
        self.0
            .compare_exchange(current as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Time of the last confirmed liveness, as millis since the clock was created.
#[derive(Debug)]
pub struct HeartbeatClock {
    origin: Instant,
    last_millis: AtomicU64,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Release);
    }

    pub fn since_last(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_millis.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.since_last() > threshold
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct FailureInner {
    raised: AtomicBool,
    notify: Notify,
}

/// Cloneable handle that connections use to report an error or close.
///
/// Many raises before the monitor looks collapse into one pending failure.
#[derive(Debug, Clone, Default)]
pub struct FailureSignal {
    inner: Arc<FailureInner>,
}

impl FailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: &str) {
        debug!(reason, "Connection failure signalled");
        self.inner.raised.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Returns whether a failure was pending and clears it.
    pub fn take(&self) -> bool {
        self.inner.raised.swap(false, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::Release);
    }

    pub async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}
