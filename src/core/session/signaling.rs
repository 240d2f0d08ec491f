//! Signaling contract and the WebSocket connector.
//!
//! Every signaling frame is a JSON text message with a `type` field. Five
//! types are interpreted by the session; anything else is an opaque relay
//! payload (peer-connection bootstrap) passed through untouched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use super::role::Participant;
use super::SessionError;

/// Messages the session itself reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated {
        user_id: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        task_id: Option<String>,
    },
    ParticipantsList {
        participants: Vec<Participant>,
    },
    ParticipantJoined {
        participant: Participant,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        user_id: String,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
}

const EVENT_TYPES: [&str; 5] = [
    "authenticated",
    "participants-list",
    "participant-joined",
    "participant-left",
    "error",
];

/// One inbound signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Event(SignalingEvent),
    Relay(Value),
}

impl SignalingMessage {
    /// Classify a text frame. Known types must be well-formed; anything
    /// else that is a JSON object is a relay.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_str(text)?;
        let known = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| EVENT_TYPES.contains(&t));
        if known {
            return Ok(SignalingMessage::Event(serde_json::from_value(value)?));
        }
        if !value.is_object() {
            return Err(SessionError::Protocol(format!("expected a JSON object, got {value}")));
        }
        Ok(SignalingMessage::Relay(value))
    }

    pub fn to_value(&self) -> Result<Value, SessionError> {
        match self {
            SignalingMessage::Event(event) => Ok(serde_json::to_value(event)?),
            SignalingMessage::Relay(value) => Ok(value.clone()),
        }
    }
}

impl From<SignalingEvent> for SignalingMessage {
    fn from(event: SignalingEvent) -> Self {
        SignalingMessage::Event(event)
    }
}

/// Opens signaling links. The session manager calls `connect` once per
/// attempt, including reconnects.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn SignalingLink>>;
}

/// A live, duplex signaling connection.
#[async_trait]
pub trait SignalingLink: Send {
    /// Next inbound message. `None` once the remote closed the link.
    /// A frame that does not decode is reported as a [`SessionError`] and
    /// skipped by the session; any other error ends the link.
    /// Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<SignalingMessage>>;

    async fn send(&mut self, message: Value) -> Result<()>;

    async fn close(&mut self);
}

// ── WebSocket ────────────────────────────────────────────────────────────────

/// Connects over `ws://` or `wss://`. The session driver bounds each
/// attempt with its own connect timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn SignalingLink>> {
        info!(event = "signaling_connect", %address);
        let (stream, response) = connect_async(address)
            .await
            .with_context(|| format!("Failed to connect to {address}"))?;
        debug!(event = "signaling_handshake", %address, status = %response.status());
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalingLink for WebSocketLink {
    async fn recv(&mut self) -> Option<Result<SignalingMessage>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            match frame {
                Message::Text(text) => {
                    return Some(SignalingMessage::parse(&text).map_err(Into::into));
                }
                Message::Close(reason) => {
                    debug!(event = "signaling_close_frame", ?reason);
                    return None;
                }
                other => {
                    trace!(event = "signaling_frame_skipped", bytes = other.len());
                }
            }
        }
    }

    async fn send(&mut self, message: Value) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
