//! Per-user session actor.
//!
//! Everything that belongs to one user (debounce buffer, processing flag,
//! flush timer) is owned by a single task and mutated only through its
//! mailbox, so no per-user state is ever shared across tasks.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClearInFlight, is_clear_command};
use crate::debounce::MessageBuffer;
use crate::error::{BridgeError, FailureCategory, GENERIC_FAILURE_REPLY};
use crate::gate::{FlightSlot, Landing};
use crate::orchestrator::Shared;
use crate::registry::ConversationKey;
use crate::transport::UserId;

pub const CLEAR_CONFIRMATION: &str =
    "Memory cleared. Your next message will be treated as the start of a new conversation.";

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Inbound {
        text: String,
    },
    /// A debounce timer fired.
    FlushDue {
        seq: u64,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time view of one user's session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub user: UserId,
    pub conversation_key: Option<ConversationKey>,
    /// Fragments waiting for the next request
    pub buffered: Vec<String>,
    /// Whether a backend request is outstanding
    pub processing: bool,
    pub flush_pending: bool,
    pub last_update: Option<Instant>,
}

#[derive(Clone)]
pub(crate) struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn spawn(user: UserId, shared: Arc<Shared>, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(shared.config.mailbox_capacity.max(1));
        let actor = SessionActor {
            user,
            weak_self: sender.downgrade(),
            receiver,
            shared,
            shutdown,
            buffer: MessageBuffer::new(),
            slot: FlightSlot::new(),
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    pub async fn inbound(&self, user: &UserId, text: String) -> Result<(), BridgeError> {
        self.sender
            .send(SessionCommand::Inbound { text })
            .await
            .map_err(|_| BridgeError::SessionGone(user.clone()))
    }

    pub async fn snapshot(&self, user: &UserId) -> Result<SessionSnapshot, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| BridgeError::SessionGone(user.clone()))?;
        rx.await.map_err(|_| BridgeError::SessionGone(user.clone()))
    }

    /// Stop the actor, cancelling its in-flight request. Resolves once the
    /// request task has ended.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct SessionActor {
    user: UserId,
    receiver: mpsc::Receiver<SessionCommand>,
    /// For flush timers. Weak so the mailbox closes once every handle is gone.
    weak_self: mpsc::WeakSender<SessionCommand>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    buffer: MessageBuffer,
    slot: FlightSlot,
}

impl SessionActor {
    async fn run(mut self) {
        debug!(user = %self.user, "session started");
        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                landing = self.slot.landed(), if self.slot.is_busy() => {
                    self.on_landing(landing).await;
                }
            }
        }
        self.buffer.reset();
        self.slot.cancel();
        debug!(user = %self.user, "session stopped");
    }

    async fn handle(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Inbound { text } => self.on_inbound(text).await,
            SessionCommand::FlushDue { seq } => self.on_flush_due(seq).await,
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot().await);
            }
            SessionCommand::Shutdown { respond_to } => {
                self.stop().await;
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_inbound(&mut self, text: String) {
        self.shared.metrics.message_received();
        debug!(user = %self.user, chars = text.chars().count(), "inbound message");

        if is_clear_command(&text) {
            self.clear().await;
            return;
        }
        self.shared.registry.get_or_create(&self.user).await;

        if self.slot.is_busy() || self.shared.config.is_short(&text) {
            self.hold(text).await;
        } else if !self.buffer.is_empty() {
            // A complete message ends the burst: send it with what came before.
            self.buffer.push(text);
            self.flush_buffer().await;
        } else {
            self.submit(text).await;
        }
    }

    /// Park a fragment in the debounce buffer.
    async fn hold(&mut self, text: String) {
        let weak = self.weak_self.clone();
        self.buffer
            .append(text, self.shared.config.debounce_delay, move |seq| async move {
                if let Some(sender) = weak.upgrade() {
                    let _ = sender.send(SessionCommand::FlushDue { seq }).await;
                }
            });
        self.shared.metrics.message_buffered();
        debug!(
            user = %self.user,
            buffered = self.buffer.len(),
            processing = self.slot.is_busy(),
            "message buffered"
        );
        self.send_typing(true).await;
    }

    async fn on_flush_due(&mut self, seq: u64) {
        if !self.buffer.acknowledge_fire(seq) {
            debug!(user = %self.user, seq = seq, "stale flush timer ignored");
            return;
        }
        if self.slot.is_busy() {
            debug!(user = %self.user, "flush deferred until the current request lands");
            return;
        }
        self.flush_buffer().await;
    }

    /// Submit everything buffered as one request.
    async fn flush_buffer(&mut self) {
        let had_fragments = !self.buffer.is_empty();
        match self.buffer.take_combined() {
            Some(text) => self.submit(text).await,
            // Only blank fragments: take back the typing indicator they raised.
            None if had_fragments => self.send_typing(false).await,
            None => {}
        }
    }

    async fn submit(&mut self, text: String) {
        if self.slot.is_busy() {
            self.buffer.push(text);
            return;
        }

        let key = self.shared.registry.get_or_create(&self.user).await;
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let shared = self.shared.clone();
        let user = self.user.clone();

        self.shared.metrics.backend_request();
        debug!(user = %self.user, key = %key, chars = text.chars().count(), "submitting request");

        self.slot.launch(cancel, async move {
            let answer = shared.gate.submit(&user, &key, &text, &token).await?;
            if token.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            shared.dispatcher.deliver(&user, &answer.text, &token).await
        });
    }

    async fn on_landing(&mut self, landing: Landing) {
        self.record_landing(landing).await;
        if !self.shutdown.is_cancelled() {
            self.flush_buffer().await;
        }
    }

    async fn record_landing(&mut self, landing: Landing) {
        match landing {
            Landing::Finished {
                id,
                result: Ok(messages),
            } => {
                self.shared.metrics.reply_sent(messages);
                debug!(user = %self.user, flight = id, messages = messages, "reply delivered");
            }
            Landing::Finished { id, result: Err(e) } if e.is_cancelled() => {
                self.shared.metrics.request_cancelled();
                debug!(user = %self.user, flight = id, "request cancelled");
            }
            Landing::Finished { id, result: Err(e) } => {
                debug!(user = %self.user, flight = id, "request failed");
                self.report_failure(&e).await;
            }
            Landing::Panicked { id } => {
                self.shared.metrics.backend_error();
                error!(user = %self.user, flight = id, "request task panicked");
                self.reply(GENERIC_FAILURE_REPLY).await;
            }
        }
    }

    async fn report_failure(&mut self, err: &BridgeError) {
        if let BridgeError::TransportSend(inner) = err {
            // Nothing can reach the user while sends fail.
            self.shared.metrics.transport_error();
            error!(user = %self.user, error = %inner, "failed to deliver reply");
            return;
        }

        self.shared.metrics.backend_error();
        let category = FailureCategory::for_error(err);
        error!(
            user = %self.user,
            error = %err,
            code = err.error_code(),
            category = ?category,
            "request failed"
        );
        self.reply(category.user_message()).await;
    }

    async fn clear(&mut self) {
        self.shared.metrics.clear();
        info!(user = %self.user, processing = self.slot.is_busy(), "clearing conversation");

        let had_fragments = !self.buffer.is_empty();
        self.buffer.reset();

        if self.slot.is_busy() {
            match self.shared.config.clear_in_flight {
                ClearInFlight::Deliver => {
                    debug!(user = %self.user, "in-flight reply will still be delivered");
                }
                ClearInFlight::Cancel => {
                    self.slot.cancel();
                    let landing = self.slot.landed().await;
                    self.record_landing(landing).await;
                }
            }
        } else if had_fragments {
            self.send_typing(false).await;
        }

        if let Some(retired) = self.shared.registry.invalidate(&self.user).await {
            if let Err(e) = self.shared.backend.clear_conversation(&retired).await {
                warn!(user = %self.user, key = %retired, error = %e, "backend failed to clear conversation");
            }
        }

        self.reply(CLEAR_CONFIRMATION).await;
    }

    async fn stop(&mut self) {
        self.buffer.reset();
        if self.slot.is_busy() {
            self.slot.cancel();
            let landing = self.slot.landed().await;
            self.record_landing(landing).await;
        }
    }

    async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user: self.user.clone(),
            conversation_key: self.shared.registry.get(&self.user).await,
            buffered: self.buffer.fragments().to_vec(),
            processing: self.slot.is_busy(),
            flush_pending: self.buffer.has_pending_timer(),
            last_update: self.buffer.last_update(),
        }
    }

    async fn reply(&self, text: &str) {
        if let Err(e) = self.shared.transport.send_message(&self.user, text).await {
            self.shared.metrics.transport_error();
            warn!(user = %self.user, error = %e, "failed to send reply");
        }
    }

    async fn send_typing(&self, typing: bool) {
        if let Err(e) = self.shared.transport.send_typing(&self.user, typing).await {
            debug!(user = %self.user, error = %e, "typing notification failed");
        }
    }
}
