use std::sync::atomic::{AtomicUsize, Ordering};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed in flight to a consumer
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging
    pub id: String,
}

impl ChannelConfig {
    /// Config for the channel in `slot` of pool generation `generation`.
    pub fn for_slot(prefetch_count: u16, confirm_mode: bool, generation: u64, slot: usize) -> Self {
        Self {
            prefetch_count,
            confirm_mode,
            id: format!("channel-{}-{}", generation, slot),
        }
    }
}

/// Rotating counter used to spread callers over pooled channels.
#[derive(Debug, Default)]
pub struct ChannelSelector {
    next: AtomicUsize,
}

impl ChannelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields slot indices starting at the next position, covering every slot once.
    pub fn rotation(&self, len: usize) -> impl Iterator<Item = usize> {
        let start = if len == 0 {
            0
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % len
        };
        (0..len).map(move |offset| (start + offset) % len)
    }
}
