//! User identity → conversation key.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::transport::UserId;

/// Local correlation token for one conversation.
///
/// Minted from a time-ordered UUID, so a fresh key never repeats one handed
/// out earlier in the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn mint() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ConversationRegistry {
    keys: RwLock<HashMap<UserId, ConversationKey>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, user: &UserId) -> ConversationKey {
        if let Some(key) = self.keys.read().await.get(user) {
            return key.clone();
        }

        let mut keys = self.keys.write().await;
        keys.entry(user.clone())
            .or_insert_with(|| {
                let key = ConversationKey::mint();
                debug!(user = %user, key = %key, "new conversation");
                key
            })
            .clone()
    }

    pub async fn get(&self, user: &UserId) -> Option<ConversationKey> {
        self.keys.read().await.get(user).cloned()
    }

    /// Drop the user's mapping, returning the retired key.
    pub async fn invalidate(&self, user: &UserId) -> Option<ConversationKey> {
        let retired = self.keys.write().await.remove(user);
        if let Some(key) = &retired {
            debug!(user = %user, key = %key, "conversation invalidated");
        }
        retired
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}
