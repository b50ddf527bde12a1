//! Outbound delivery: chunking and pacing of answers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BridgeError;
use crate::transport::{Transport, UserId};

pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;

/// Split `text` into transport-sized messages.
///
/// Text that fits is returned unchanged. Longer text is cut into
/// `max_len`-character slices, each labelled `[i/N] `. Lengths count
/// characters, so a multi-byte character is never split.
pub fn split_into_chunks(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return vec![text.to_string()];
    }

    let total = chars.len().div_ceil(max_len);
    chars
        .chunks(max_len)
        .enumerate()
        .map(|(i, chunk)| {
            let body: String = chunk.iter().collect();
            format!("[{}/{}] {}", i + 1, total, body)
        })
        .collect()
}

#[derive(Clone)]
pub struct ResponseDispatcher {
    transport: Arc<dyn Transport>,
    max_len: usize,
    chunk_delay: Duration,
}

impl ResponseDispatcher {
    pub fn new(transport: Arc<dyn Transport>, max_len: usize, chunk_delay: Duration) -> Self {
        Self {
            transport,
            max_len,
            chunk_delay,
        }
    }

    /// Send `text` to `recipient`, paced between chunks. Returns the number
    /// of messages sent.
    pub async fn deliver(
        &self,
        recipient: &UserId,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, BridgeError> {
        let chunks = split_into_chunks(text, self.max_len);
        let total = chunks.len();
        if total > 1 {
            debug!(user = %recipient, chunks = total, "delivering chunked answer");
        }

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                    _ = tokio::time::sleep(self.chunk_delay) => {}
                }
            }
            self.transport
                .send_message(recipient, chunk)
                .await
                .map_err(BridgeError::TransportSend)?;
        }
        Ok(total)
    }
}
