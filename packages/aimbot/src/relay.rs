//! WebSocket relay transport.
//!
//! The bot does not speak the IM wire protocol itself. It logs in to a relay
//! that holds the IM session and exchanges JSON frames with it:
//!
//! ```text
//! → {"type":"login","screen_name":"AIGURU9000","password":"..."}
//! → {"type":"message","to":"buddy","text":"hello"}
//! → {"type":"typing","to":"buddy","typing":true}
//! ← {"type":"message","from":"buddy","text":"hi bot"}
//! ← {"type":"error","message":"..."}
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convo_bridge::{EventSender, InboundMessage, Transport, TransportError, TransportEvent, UserId};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub url: String,
    pub screen_name: String,
    pub password: Option<String>,
}

/// Frames the bot sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        screen_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Message {
        to: String,
        text: String,
    },
    Typing {
        to: String,
        typing: bool,
    },
}

/// Frames the relay sends to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Message {
        from: String,
        text: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

struct Link {
    outbound: mpsc::Sender<ClientFrame>,
    cancel: CancellationToken,
}

pub struct RelayTransport {
    config: RelayConfig,
    events: EventSender,
    link: Mutex<Option<Link>>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            link: Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let outbound = {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(TransportError::NotConnected)?;
            if link.cancel.is_cancelled() {
                return Err(TransportError::Closed);
            }
            link.outbound.clone()
        };
        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

fn encode(frame: &ClientFrame) -> Result<Message, TransportError> {
    let json = serde_json::to_string(frame).map_err(|e| TransportError::Send(e.to_string()))?;
    Ok(Message::Text(json.into()))
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if let Some(stale) = self.link.lock().await.take() {
            stale.cancel.cancel();
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let login = ClientFrame::Login {
            screen_name: self.config.screen_name.clone(),
            password: self.config.password.clone(),
        };
        ws_write
            .send(encode(&login)?)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (outbound, mut outbound_rx) = mpsc::channel::<ClientFrame>(64);
        // `cancel` is an intentional disconnect; `lost` is a failed write.
        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();

        // Writer
        let wc = cancel.clone();
        let wl = lost.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wc.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let msg = match encode(&frame) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(error = %e, "dropping unencodable frame");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(msg).await {
                            warn!(error = %e, "relay write failed");
                            wl.cancel();
                            break;
                        }
                    }
                }
            }
        });

        // Reader
        let rc = cancel.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = rc.cancelled() => {
                        debug!("relay reader stopped");
                        return;
                    }
                    _ = lost.cancelled() => break "relay write failed".to_string(),
                    msg = ws_read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(RelayFrame::Message { from, text }) => {
                                let event = TransportEvent::Message(InboundMessage::new(from, text));
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Ok(RelayFrame::Error { message }) => {
                                warn!(message = %message, "relay reported an error");
                            }
                            Ok(RelayFrame::Unknown) => debug!("ignoring unknown relay frame"),
                            Err(e) => warn!(error = %e, "malformed relay frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by relay".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "relay stream ended".to_string(),
                    },
                }
            };

            // Stop the writer so later sends fail fast.
            rc.cancel();
            info!(reason = %reason, "relay connection lost");
            let _ = events.send(TransportEvent::Disconnected { reason }).await;
        });

        *self.link.lock().await = Some(Link { outbound, cancel });
        info!(url = %self.config.url, screen_name = %self.config.screen_name, "connected to relay");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.cancel.cancel();
            info!("disconnected from relay");
        }
    }

    async fn send_message(&self, recipient: &UserId, text: &str) -> Result<(), TransportError> {
        self.send_frame(ClientFrame::Message {
            to: recipient.to_string(),
            text: text.to_string(),
        })
        .await
    }

    async fn send_typing(&self, recipient: &UserId, typing: bool) -> Result<(), TransportError> {
        self.send_frame(ClientFrame::Typing {
            to: recipient.to_string(),
            typing,
        })
        .await
    }
}
