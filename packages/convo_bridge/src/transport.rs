//! The chat transport seam: what the engine needs from an IM connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Transport-level handle of a remote user (a screen name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(Arc<str>);

impl UserId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: UserId,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender: impl Into<UserId>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Events a transport pushes into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The connection dropped without `disconnect()` being called.
    Disconnected { reason: String },
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Bounded channel a transport uses to deliver inbound events.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Intentional disconnect. Must not emit [`TransportEvent::Disconnected`].
    async fn disconnect(&self);

    async fn send_message(&self, recipient: &UserId, text: &str) -> Result<(), TransportError>;

    async fn send_typing(&self, recipient: &UserId, typing: bool) -> Result<(), TransportError>;
}
