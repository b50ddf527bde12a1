//! Dify chat-messages API client (blocking response mode).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use convo_bridge::{Answer, Backend, BackendError, ConversationKey};

#[derive(Clone, Debug)]
pub struct DifyConfig {
    /// Base URL including the API version, e.g. `https://api.dify.ai/v1`.
    pub api_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    query: &'a str,
    /// Dify scopes conversations per end user; the conversation key is
    /// used so a reset conversation starts clean server-side.
    user: &'a str,
    response_mode: &'static str,
    conversation_id: &'a str,
    inputs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct DeleteConversationRequest<'a> {
    user: &'a str,
}

#[derive(Default)]
struct ConversationState {
    /// Our conversation key → Dify's server-issued conversation id.
    conversations: HashMap<ConversationKey, String>,
    /// Keys with a chat request outstanding.
    in_flight: HashSet<ConversationKey>,
    /// In-flight keys cleared before their request landed.
    retired: HashSet<ConversationKey>,
}

/// Tracks one outstanding chat request. Dropping it (a cancelled request)
/// forgets the key without recording a conversation.
struct InFlight<'a> {
    client: &'a DifyClient,
    key: ConversationKey,
    finished: bool,
}

impl InFlight<'_> {
    /// Returns whether the key was cleared while the request ran.
    fn finish(mut self) -> bool {
        self.finished = true;
        let mut state = self.client.state();
        state.in_flight.remove(&self.key);
        state.retired.remove(&self.key)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.client.state();
            state.in_flight.remove(&self.key);
            state.retired.remove(&self.key);
        }
    }
}

pub struct DifyClient {
    http: reqwest::Client,
    config: DifyConfig,
    state: Mutex<ConversationState>,
}

impl DifyClient {
    pub fn new(config: DifyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            state: Mutex::new(ConversationState::default()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    // Never held across an await.
    fn state(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dify conversation behind `key`, once the backend has issued one.
    pub fn conversation_id(&self, key: &ConversationKey) -> Option<String> {
        self.state().conversations.get(key).cloned()
    }

    fn begin(&self, key: &ConversationKey) -> (InFlight<'_>, String) {
        let mut state = self.state();
        state.in_flight.insert(key.clone());
        let conversation_id = state.conversations.get(key).cloned().unwrap_or_default();
        let guard = InFlight {
            client: self,
            key: key.clone(),
            finished: false,
        };
        (guard, conversation_id)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_chat(
        &self,
        key: &ConversationKey,
        text: &str,
        conversation_id: &str,
    ) -> Result<ChatResponse, BackendError> {
        let body = ChatRequest {
            query: text,
            user: key.as_str(),
            response_mode: "blocking",
            conversation_id,
            inputs: serde_json::Map::new(),
        };

        debug!(key = %key, continuing = !conversation_id.is_empty(), "sending chat message");
        let resp = self
            .http
            .post(self.endpoint("chat-messages"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let resp = Self::check_status(resp).await?;

        resp.json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn delete_conversation(&self, key: &ConversationKey, id: &str) -> Result<(), BackendError> {
        let resp = self
            .http
            .delete(self.endpoint(&format!("conversations/{id}")))
            .bearer_auth(&self.config.api_key)
            .json(&DeleteConversationRequest { user: key.as_str() })
            .send()
            .await
            .map_err(request_error)?;
        Self::check_status(resp).await?;

        debug!(key = %key, conversation_id = %id, "backend conversation deleted");
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Request(format!("timed out: {err}"))
    } else {
        BackendError::Request(err.to_string())
    }
}

#[async_trait]
impl Backend for DifyClient {
    async fn send_message(&self, key: &ConversationKey, text: &str) -> Result<Answer, BackendError> {
        let (in_flight, conversation_id) = self.begin(key);
        let result = self.post_chat(key, text, &conversation_id).await;
        let retired = in_flight.finish();
        let parsed = result?;

        if let Some(id) = parsed.conversation_id.filter(|id| !id.is_empty()) {
            if retired {
                // Cleared mid-request. A conversation we already knew was
                // deleted by the clear; a new one is deleted here.
                if id != conversation_id {
                    if let Err(e) = self.delete_conversation(key, &id).await {
                        warn!(key = %key, conversation_id = %id, error = %e, "failed to delete orphaned conversation");
                    }
                }
            } else {
                if id != conversation_id {
                    debug!(key = %key, conversation_id = %id, "backend conversation assigned");
                }
                self.state().conversations.insert(key.clone(), id);
            }
        }

        Ok(Answer {
            text: parsed.answer,
            metadata: parsed.metadata,
        })
    }

    async fn clear_conversation(&self, key: &ConversationKey) -> Result<bool, BackendError> {
        let id = {
            let mut state = self.state();
            if state.in_flight.contains(key) {
                state.retired.insert(key.clone());
            }
            state.conversations.remove(key)
        };
        let Some(id) = id else {
            return Ok(false);
        };

        self.delete_conversation(key, &id).await?;
        Ok(true)
    }

    async fn close(&self) {
        let forgotten = {
            let mut state = self.state();
            let n = state.conversations.len();
            *state = ConversationState::default();
            n
        };
        info!(conversations = forgotten, "backend client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{delete, post},
    };
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorded {
        chats: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        deletes: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn chat(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        recorded.chats.lock().unwrap().push((auth, body.clone()));
        if body["query"].as_str().is_some_and(|q| q.starts_with("slow")) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        match body["query"].as_str() {
            Some("too fast") => (StatusCode::TOO_MANY_REQUESTS, "rate limit reached").into_response(),
            Some("garbage") => (StatusCode::OK, "not json").into_response(),
            Some(query) => Json(json!({
                "answer": format!("echo: {query}"),
                "conversation_id": "conv-1",
                "metadata": {"usage": {"total_tokens": 42}},
            }))
            .into_response(),
            None => StatusCode::BAD_REQUEST.into_response(),
        }
    }

    async fn delete_conversation(
        State(recorded): State<Recorded>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        recorded.deletes.lock().unwrap().push((id, body));
        Json(json!({"result": "success"}))
    }

    async fn spawn_dify() -> (DifyClient, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/v1/chat-messages", post(chat))
            .route("/v1/conversations/{id}", delete(delete_conversation))
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = DifyClient::new(DifyConfig {
            api_url: format!("http://{addr}/v1/"),
            api_key: "test-key".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        (client, recorded)
    }

    #[tokio::test]
    async fn sends_blocking_request_and_continues_conversation() {
        let (client, recorded) = spawn_dify().await;
        let key = ConversationKey::from("key-a");

        let answer = client.send_message(&key, "hello there").await.unwrap();
        assert_eq!(answer.text, "echo: hello there");
        assert_eq!(answer.metadata["usage"]["total_tokens"], 42);
        assert_eq!(client.conversation_id(&key).as_deref(), Some("conv-1"));

        client.send_message(&key, "and again").await.unwrap();

        let chats = recorded.chats.lock().unwrap().clone();
        assert_eq!(chats.len(), 2);
        let (auth, first) = &chats[0];
        assert_eq!(auth.as_deref(), Some("Bearer test-key"));
        assert_eq!(first["response_mode"], "blocking");
        assert_eq!(first["user"], "key-a");
        assert_eq!(first["conversation_id"], "");
        assert_eq!(first["inputs"], json!({}));
        assert_eq!(chats[1].1["conversation_id"], "conv-1");
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let (client, _) = spawn_dify().await;
        let err = client
            .send_message(&ConversationKey::from("key-b"), "too fast")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("rate limit reached"));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let (client, _) = spawn_dify().await;
        let err = client
            .send_message(&ConversationKey::from("key-c"), "garbage")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn clear_deletes_known_conversation_once() {
        let (client, recorded) = spawn_dify().await;
        let key = ConversationKey::from("key-d");
        client.send_message(&key, "remember me").await.unwrap();

        assert!(client.clear_conversation(&key).await.unwrap());
        assert!(!client.clear_conversation(&key).await.unwrap());
        assert!(client.conversation_id(&key).is_none());

        let deletes = recorded.deletes.lock().unwrap().clone();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].0, "conv-1");
        assert_eq!(deletes[0].1["user"], "key-d");
    }

    #[tokio::test]
    async fn clear_during_first_request_deletes_the_new_conversation() {
        let (client, recorded) = spawn_dify().await;
        let client = Arc::new(client);
        let key = ConversationKey::from("key-f");

        let pending = tokio::spawn({
            let client = client.clone();
            let key = key.clone();
            async move { client.send_message(&key, "slow first words").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nothing to delete yet: the server has not issued an id.
        assert!(!client.clear_conversation(&key).await.unwrap());
        assert!(recorded.deletes.lock().unwrap().is_empty());

        let answer = pending.await.unwrap().unwrap();
        assert_eq!(answer.text, "echo: slow first words");

        assert!(client.conversation_id(&key).is_none());
        let deletes = recorded.deletes.lock().unwrap().clone();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].0, "conv-1");
        assert_eq!(deletes[0].1["user"], "key-f");
    }

    #[tokio::test]
    async fn clear_between_requests_leaves_no_tombstone() {
        let (client, recorded) = spawn_dify().await;
        let key = ConversationKey::from("key-g");

        assert!(!client.clear_conversation(&key).await.unwrap());
        client.send_message(&key, "fresh start").await.unwrap();

        assert_eq!(client.conversation_id(&key).as_deref(), Some("conv-1"));
        assert!(recorded.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_is_forgotten() {
        let (client, recorded) = spawn_dify().await;
        let key = ConversationKey::from("key-h");

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), client.send_message(&key, "slow reply")).await;
        assert!(cancelled.is_err());
        assert!(!client.clear_conversation(&key).await.unwrap());

        client.send_message(&key, "try again").await.unwrap();
        assert_eq!(client.conversation_id(&key).as_deref(), Some("conv-1"));
        assert!(recorded.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_request_error() {
        let client = DifyClient::new(DifyConfig {
            api_url: "http://127.0.0.1:9/v1".into(),
            api_key: "k".into(),
            request_timeout: Duration::from_secs(2),
        })
        .unwrap();
        let err = client
            .send_message(&ConversationKey::from("key-e"), "anyone home?")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Request(_)));
    }
}
