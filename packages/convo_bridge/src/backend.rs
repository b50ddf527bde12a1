//! The answering-service seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::registry::ConversationKey;

/// A complete (non-streamed) answer from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Backend-specific extras (usage, retriever resources, ...). Opaque to the engine.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Answer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Ask the backend. An unknown `key` starts a new server-side conversation.
    async fn send_message(&self, key: &ConversationKey, text: &str) -> Result<Answer, BackendError>;

    /// Forget the server-side conversation behind `key`. Returns whether one existed.
    async fn clear_conversation(&self, key: &ConversationKey) -> Result<bool, BackendError>;

    /// Release pooled resources on shutdown.
    async fn close(&self) {}
}
