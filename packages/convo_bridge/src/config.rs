//! Engine tunables.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DEFAULT_MAX_MESSAGE_LEN;
use crate::reconnect::ReconnectPolicy;

/// What a "clear" does to a request that is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearInFlight {
    /// Let the request finish and deliver its answer.
    #[default]
    Deliver,
    /// Cancel the request and drop its answer.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Quiet period before buffered fragments are flushed.
    pub debounce_delay: Duration,
    /// Trimmed messages shorter than this (in characters) are buffered.
    pub short_message_threshold: usize,
    pub typing_interval: Duration,
    /// Human-like pause before the first typing signal. `None` disables it.
    pub pre_typing_delay: Option<RangeInclusive<Duration>>,
    pub max_message_len: usize,
    pub chunk_delay: Duration,
    pub clear_in_flight: ClearInFlight,
    /// Capacity of each per-user session mailbox.
    pub mailbox_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(1500),
            short_message_threshold: 10,
            typing_interval: Duration::from_secs(5),
            pre_typing_delay: Some(Duration::from_secs(1)..=Duration::from_secs(3)),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            chunk_delay: Duration::from_millis(500),
            clear_in_flight: ClearInFlight::Deliver,
            mailbox_capacity: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Whether `text` is short enough to wait for more fragments.
    pub fn is_short(&self, text: &str) -> bool {
        text.trim().chars().count() < self.short_message_threshold
    }
}

/// Inbound text that resets the conversation instead of being forwarded.
pub fn is_clear_command(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("clear")
}
