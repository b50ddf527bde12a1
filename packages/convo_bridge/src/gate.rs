//! Single-flight request handling.
//!
//! [`FlightSlot`] is the per-user processing flag: it holds at most one
//! request task and is only emptied once that task has ended, whether it
//! returned, was cancelled, or panicked. [`SingleFlightGate`] is the request
//! pipeline run inside that task.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Answer, Backend};
use crate::error::{BackendError, BridgeError};
use crate::registry::ConversationKey;
use crate::transport::{Transport, UserId};
use crate::typing::TypingHeartbeat;

#[derive(Clone)]
pub struct SingleFlightGate {
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    typing_interval: Duration,
    pre_typing_delay: Option<RangeInclusive<Duration>>,
}

impl SingleFlightGate {
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        typing_interval: Duration,
        pre_typing_delay: Option<RangeInclusive<Duration>>,
    ) -> Self {
        Self {
            transport,
            backend,
            typing_interval,
            pre_typing_delay,
        }
    }

    /// Ask the backend on behalf of `recipient`, keeping their typing
    /// indicator alive meanwhile. Exactly one typing=false is sent before
    /// this returns, also when `cancel` fires.
    pub async fn submit(
        &self,
        recipient: &UserId,
        key: &ConversationKey,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer, BridgeError> {
        if let Some(delay) = self.pick_pre_typing_delay() {
            debug!(user = %recipient, delay_ms = delay.as_millis() as u64, "pre-typing pause");
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.signal_stopped(recipient).await;
                    return Err(BridgeError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut heartbeat = TypingHeartbeat::start(
            self.transport.clone(),
            recipient.clone(),
            self.typing_interval,
            cancel,
        )
        .await;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            answer = self.backend.send_message(key, text) => answer.map_err(BridgeError::from),
        };
        heartbeat.stop().await;

        let answer = result?;
        if answer.text.trim().is_empty() {
            return Err(BackendError::EmptyAnswer.into());
        }
        Ok(answer)
    }

    fn pick_pre_typing_delay(&self) -> Option<Duration> {
        let range = self.pre_typing_delay.as_ref()?;
        let (low, high) = (*range.start(), *range.end());
        if high.is_zero() {
            return None;
        }
        if low >= high {
            return Some(low);
        }
        Some(rand::rng().random_range(low..=high))
    }

    async fn signal_stopped(&self, recipient: &UserId) {
        if let Err(e) = self.transport.send_typing(recipient, false).await {
            warn!(user = %recipient, error = %e, "failed to clear typing indicator");
        }
    }
}

/// How a flight ended.
#[derive(Debug)]
pub enum Landing {
    Finished {
        id: u64,
        result: Result<usize, BridgeError>,
    },
    Panicked {
        id: u64,
    },
}

struct Flight {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<Result<usize, BridgeError>>,
}

/// The per-user processing flag together with the task it guards.
#[derive(Default)]
pub struct FlightSlot {
    current: Option<Flight>,
    next_id: u64,
}

impl FlightSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Spawn `request` unless a flight is already out. Returns the flight id,
    /// or `None` when busy.
    pub fn launch<F>(&mut self, cancel: CancellationToken, request: F) -> Option<u64>
    where
        F: Future<Output = Result<usize, BridgeError>> + Send + 'static,
    {
        if self.is_busy() {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        let handle = tokio::spawn(request);
        self.current = Some(Flight { id, cancel, handle });
        Some(id)
    }

    /// Ask the current flight to stop. The slot stays busy until it lands.
    pub fn cancel(&self) {
        if let Some(flight) = &self.current {
            flight.cancel.cancel();
        }
    }

    /// Wait for the current flight to end and free the slot. Never resolves
    /// while idle. Cancel-safe.
    pub async fn landed(&mut self) -> Landing {
        let Some(flight) = self.current.as_mut() else {
            return std::future::pending().await;
        };
        let joined = (&mut flight.handle).await;
        let id = flight.id;
        self.current = None;

        match joined {
            Ok(result) => Landing::Finished { id, result },
            Err(e) if e.is_cancelled() => Landing::Finished {
                id,
                result: Err(BridgeError::Cancelled),
            },
            Err(_) => Landing::Panicked { id },
        }
    }
}

impl Drop for FlightSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
