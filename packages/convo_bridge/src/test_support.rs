//! Recording collaborators for engine tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::{Answer, Backend};
use crate::error::{BackendError, TransportError};
use crate::registry::ConversationKey;
use crate::transport::{Transport, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Message { to: UserId, text: String, at: Instant },
    Typing { to: UserId, typing: bool, at: Instant },
}

impl Sent {
    pub fn at(&self) -> Instant {
        match self {
            Sent::Message { at, .. } | Sent::Typing { at, .. } => *at,
        }
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    connect_attempts: Mutex<Vec<Instant>>,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results for the next `connect()` calls; afterwards connects succeed.
    pub fn script_connects(&self, results: impl IntoIterator<Item = Result<(), TransportError>>) {
        self.connect_script.lock().unwrap().extend(results);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.connect_attempts.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages_to(&self, user: &UserId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Message { to, text, .. } if &to == user => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn typing_for(&self, user: &UserId) -> Vec<bool> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Typing { to, typing, .. } if &to == user => Some(typing),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_attempts.lock().unwrap().push(Instant::now());
        let result = self
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn send_message(&self, recipient: &UserId, text: &str) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("scripted failure".into()));
        }
        self.sent.lock().unwrap().push(Sent::Message {
            to: recipient.clone(),
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn send_typing(&self, recipient: &UserId, typing: bool) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Typing {
            to: recipient.clone(),
            typing,
            at: Instant::now(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub key: ConversationKey,
    pub text: String,
    pub at: Instant,
}

pub struct ScriptedBackend {
    latency: Duration,
    calls: Mutex<Vec<BackendCall>>,
    responses: Mutex<VecDeque<Result<Answer, BackendError>>>,
    cleared: Mutex<Vec<ConversationKey>>,
    clear_fails: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            cleared: Mutex::new(Vec::new()),
            clear_fails: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a result for the next request; unqueued requests echo their text.
    pub fn respond_with(&self, result: Result<Answer, BackendError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn fail_clears(&self, fail: bool) {
        self.clear_fails.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.text).collect()
    }

    pub fn cleared(&self) -> Vec<ConversationKey> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn send_message(&self, key: &ConversationKey, text: &str) -> Result<Answer, BackendError> {
        self.calls.lock().unwrap().push(BackendCall {
            key: key.clone(),
            text: text.to_string(),
            at: Instant::now(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        tokio::time::sleep(self.latency).await;

        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(Answer::new(format!("answer to: {text}"))))
    }

    async fn clear_conversation(&self, key: &ConversationKey) -> Result<bool, BackendError> {
        if self.clear_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Request("scripted clear failure".into()));
        }
        self.cleared.lock().unwrap().push(key.clone());
        Ok(true)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
