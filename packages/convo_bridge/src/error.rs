//! Error types and the mapping from backend failures to user-facing replies.

use crate::transport::UserId;

/// Failures raised by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport closed")]
    Closed,
}

/// Failures raised by a [`Backend`](crate::Backend) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend response could not be decoded: {0}")]
    Decode(String),

    #[error("backend returned an empty answer")]
    EmptyAnswer,
}

impl BackendError {
    /// HTTP-like status code, when the backend produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transport connect failed: {0}")]
    TransportConnect(#[source] TransportError),

    #[error("transport send failed: {0}")]
    TransportSend(#[source] TransportError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectGaveUp { attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("session for {0} is gone")]
    SessionGone(UserId),
}

impl BridgeError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::TransportConnect(_) => "transport_connect",
            Self::TransportSend(_) => "transport_send",
            Self::Backend(_) => "backend_request",
            Self::ReconnectGaveUp { .. } => "reconnect_gave_up",
            Self::Cancelled => "cancelled",
            Self::SessionGone(_) => "session_gone",
        }
    }

    /// Cancellation is expected during shutdown and clear; it is never
    /// reported to the user or logged as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The three kinds of canned reply a failed request can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    RateLimited,
    MalformedShortInput,
    Generic,
}

pub const RATE_LIMITED_REPLY: &str =
    "I'm receiving too many messages too quickly. Please wait a moment before sending more messages.";
pub const MALFORMED_SHORT_INPUT_REPLY: &str =
    "I had trouble processing your short message. Please try sending a more complete message.";
pub const GENERIC_FAILURE_REPLY: &str =
    "Sorry, I encountered an error processing your message. Please try again in a moment.";

impl FailureCategory {
    /// Classify a failure by its rendered text.
    pub fn classify(error_text: &str) -> Self {
        if error_text.contains("429")
            || error_text.contains("Too many tokens")
            || error_text.to_lowercase().contains("rate limit")
        {
            Self::RateLimited
        } else if error_text.contains("400") && error_text.contains("blank") {
            Self::MalformedShortInput
        } else {
            Self::Generic
        }
    }

    pub fn for_error(err: &BridgeError) -> Self {
        if let BridgeError::Backend(BackendError::Status { status: 429, .. }) = err {
            return Self::RateLimited;
        }
        Self::classify(&err.to_string())
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::RateLimited => RATE_LIMITED_REPLY,
            Self::MalformedShortInput => MALFORMED_SHORT_INPUT_REPLY,
            Self::Generic => GENERIC_FAILURE_REPLY,
        }
    }
}
