//! Convo Bridge - per-user orchestration between a chat transport and a
//! conversational AI backend
//!
//! Inbound messages are routed to one session task per user. Short bursts
//! are debounced into a single request, at most one backend request is in
//! flight per user, the user's typing indicator is kept alive while it runs,
//! and long answers are split into labelled, paced chunks. The transport
//! connection is supervised with capped linear backoff.
//!
//! The crate has no network dependencies: plug in a [`Transport`] and a
//! [`Backend`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use convo_bridge::{Backend, BridgeConfig, Orchestrator, Transport, event_channel};
//!
//! async fn serve(
//!     make_transport: impl FnOnce(convo_bridge::EventSender) -> Arc<dyn Transport>,
//!     backend: Arc<dyn Backend>,
//! ) -> Result<(), convo_bridge::BridgeError> {
//!     let (events_tx, events_rx) = event_channel(256);
//!     let transport = make_transport(events_tx);
//!     let bridge = Orchestrator::new(BridgeConfig::default(), transport, backend);
//!
//!     let result = bridge.run(events_rx).await;
//!     bridge.shutdown().await;
//!     result
//! }
//! ```

mod backend;
mod config;
mod debounce;
mod dispatcher;
mod error;
mod gate;
mod metrics;
mod orchestrator;
mod reconnect;
mod registry;
mod session;
mod transport;
mod typing;

#[cfg(test)]
mod test_support;

pub use backend::{Answer, Backend};
pub use config::{BridgeConfig, ClearInFlight, is_clear_command};
pub use debounce::{MessageBuffer, combine};
pub use dispatcher::{DEFAULT_MAX_MESSAGE_LEN, ResponseDispatcher, split_into_chunks};
pub use error::{
    BackendError, BridgeError, FailureCategory, GENERIC_FAILURE_REPLY,
    MALFORMED_SHORT_INPUT_REPLY, RATE_LIMITED_REPLY, TransportError,
};
pub use gate::{FlightSlot, Landing, SingleFlightGate};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use reconnect::{ConnectionState, ReconnectController, ReconnectPolicy};
pub use registry::{ConversationKey, ConversationRegistry};
pub use session::{CLEAR_CONFIRMATION, SessionSnapshot};
pub use transport::{
    EventReceiver, EventSender, InboundMessage, Transport, TransportEvent, UserId, event_channel,
};
pub use typing::{MIN_TYPING_INTERVAL, TypingHeartbeat};
