//! Composition root: routes transport events to per-user sessions and
//! supervises the transport connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::BridgeConfig;
use crate::dispatcher::ResponseDispatcher;
use crate::error::BridgeError;
use crate::gate::SingleFlightGate;
use crate::metrics::BridgeMetrics;
use crate::reconnect::{ConnectionState, ReconnectController};
use crate::registry::ConversationRegistry;
use crate::session::{SessionHandle, SessionSnapshot};
use crate::transport::{EventReceiver, InboundMessage, Transport, TransportEvent, UserId};

/// State shared read-only by every session.
pub(crate) struct Shared {
    pub config: BridgeConfig,
    pub transport: Arc<dyn Transport>,
    pub backend: Arc<dyn Backend>,
    pub registry: ConversationRegistry,
    pub gate: SingleFlightGate,
    pub dispatcher: ResponseDispatcher,
    pub metrics: Arc<BridgeMetrics>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    sessions: RwLock<HashMap<UserId, SessionHandle>>,
    reconnect: Mutex<ReconnectController>,
    connection: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>, backend: Arc<dyn Backend>) -> Self {
        let gate = SingleFlightGate::new(
            transport.clone(),
            backend.clone(),
            config.typing_interval,
            config.pre_typing_delay.clone(),
        );
        let dispatcher =
            ResponseDispatcher::new(transport.clone(), config.max_message_len, config.chunk_delay);
        let reconnect = ReconnectController::new(config.reconnect);
        let connection = reconnect.subscribe();

        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                backend,
                registry: ConversationRegistry::new(),
                gate,
                dispatcher,
                metrics: Arc::new(BridgeMetrics::new()),
            }),
            sessions: RwLock::new(HashMap::new()),
            reconnect: Mutex::new(reconnect),
            connection,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.shared.metrics.clone()
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.shared.registry
    }

    /// Cancelling this token makes [`run`](Self::run) return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Connect the transport and dispatch its events until shutdown, the
    /// event stream ends, or reconnection is given up.
    pub async fn run(&self, mut events: EventReceiver) -> Result<(), BridgeError> {
        match self.reconnect.lock().await.connect(self.transport(), &self.shutdown).await {
            Ok(()) => {}
            Err(BridgeError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }
        info!("bridge running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.handle_message(message).await,
                    Some(TransportEvent::Disconnected { reason }) => {
                        if self.shutdown.is_cancelled() {
                            return Ok(());
                        }
                        warn!(reason = %reason, "transport disconnected unexpectedly");
                        match self.recover().await {
                            Ok(()) => {}
                            Err(BridgeError::Cancelled) => return Ok(()),
                            Err(e) => return Err(e),
                        }
                    }
                    None => {
                        info!("transport event stream closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn recover(&self) -> Result<(), BridgeError> {
        let mut reconnect = self.reconnect.lock().await;
        let result = reconnect
            .handle_disconnect(self.transport(), &self.shutdown)
            .await;
        self.shared
            .metrics
            .set_reconnect_attempts(reconnect.total_attempts());
        result
    }

    /// Route one inbound message to its sender's session.
    pub async fn handle_message(&self, message: InboundMessage) {
        if self.shutdown.is_cancelled() {
            debug!(user = %message.sender, "dropping message received during shutdown");
            return;
        }
        let Some(handle) = self.session(&message.sender).await else {
            debug!(user = %message.sender, "dropping message received during shutdown");
            return;
        };
        if let Err(e) = handle.inbound(&message.sender, message.text).await {
            warn!(user = %message.sender, error = %e, "session unavailable");
        }
    }

    /// Existing or new session for `user`; `None` once shutdown has begun.
    async fn session(&self, user: &UserId) -> Option<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(user) {
            return Some(handle.clone());
        }

        let mut sessions = self.sessions.write().await;
        // `shutdown` cancels before draining under this lock.
        if self.shutdown.is_cancelled() {
            return None;
        }
        let handle = sessions
            .entry(user.clone())
            .or_insert_with(|| {
                self.shared.metrics.session_created();
                SessionHandle::spawn(user.clone(), self.shared.clone(), self.shutdown.clone())
            })
            .clone();
        Some(handle)
    }

    pub async fn snapshot(&self, user: &UserId) -> Option<SessionSnapshot> {
        let handle = self.sessions.read().await.get(user).cloned()?;
        handle.snapshot(user).await.ok()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every session, then close the transport and the backend.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down bridge");
        self.shutdown.cancel();

        let sessions: Vec<SessionHandle> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &sessions {
            handle.shutdown().await;
        }

        self.shared.transport.disconnect().await;
        self.shared.backend.close().await;

        let snapshot = self.shared.metrics.snapshot();
        info!(
            uptime_secs = snapshot.uptime_secs,
            received = snapshot.inbound.received,
            requests = snapshot.backend.requests,
            errors = snapshot.backend.errors,
            replies = snapshot.outbound.replies,
            sessions = sessions.len(),
            "bridge stopped"
        );
    }

    fn transport(&self) -> &dyn Transport {
        self.shared.transport.as_ref()
    }
}
