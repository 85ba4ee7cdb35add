//! In-memory routing between connected users. Nothing is stored: frames for
//! a user who is not connected are dropped.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::{MessageType, UserId, UserStatus},
    protocol::{ChatMessage, InboundFrame, SignalPayload},
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct Registration {
    pub connection: u64,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

struct Peer {
    connection: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// What a client may send. Parsed loosely so a missing `target_id` can be
/// answered with an error frame instead of a parse failure.
#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    target_id: Option<UserId>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    signal: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct Relay {
    peers: RwLock<HashMap<UserId, Peer>>,
    next_connection: AtomicU64,
}

impl Relay {
    /// Adds `user` and announces them online. An older connection for the
    /// same user is told to close.
    pub async fn register(&self, user: UserId) -> Registration {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, outbound) = mpsc::unbounded_channel();
        let replaced = self
            .peers
            .write()
            .await
            .insert(user, Peer { connection, tx });
        if let Some(previous) = replaced {
            info!(user = user.0, "relay: replacing existing connection");
            let _ = previous.tx.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "replaced by a newer connection".to_string(),
            });
        }
        info!(user = user.0, connection, "relay: user connected");
        self.broadcast_status(user, UserStatus::Online).await;
        Registration {
            connection,
            outbound,
        }
    }

    /// Removes `user` unless a newer connection has taken its place.
    pub async fn unregister(&self, user: UserId, connection: u64) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(&user) {
                Some(peer) if peer.connection == connection => peers.remove(&user).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(user = user.0, connection, "relay: user disconnected");
            self.broadcast_status(user, UserStatus::Offline).await;
        } else {
            debug!(user = user.0, connection, "relay: stale connection closed");
        }
    }

    pub async fn online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.peers.read().await.keys().copied().collect();
        users.sort_by_key(|u| u.0);
        users
    }

    pub async fn handle_text(&self, from: UserId, text: &str) {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(from = from.0, %err, "relay: malformed frame");
                self.send_error(from, "Malformed frame", Some(err.to_string()))
                    .await;
                return;
            }
        };
        match frame.kind.as_deref() {
            Some("message") => self.relay_chat(from, frame).await,
            Some("webrtc-signal") => self.relay_signal(from, frame).await,
            other => {
                let kind = other.unwrap_or("none");
                debug!(from = from.0, kind, "relay: unsupported frame type");
                self.send_error(from, &format!("Unsupported message type: {kind}"), None)
                    .await;
            }
        }
    }

    async fn relay_chat(&self, from: UserId, frame: IncomingFrame) {
        let raw_type = frame.message_type.as_deref().unwrap_or("TEXT");
        let Some(message_type) = MessageType::parse(raw_type) else {
            self.send_error(from, &format!("Unsupported message type: {raw_type}"), None)
                .await;
            return;
        };
        let Some(target) = frame.target_id else {
            let failure = match message_type {
                MessageType::Text => "Failed to send message",
                MessageType::Voice => "Failed to send voice message",
                MessageType::Video => "Failed to send video message",
            };
            self.send_error(from, failure, Some("Target user ID is required".to_string()))
                .await;
            return;
        };

        let message = InboundFrame::Chat(ChatMessage {
            from_user: from,
            to_user: target,
            content: frame.content.unwrap_or_default(),
            message_type,
            timestamp: Some(Utc::now()),
            id: None,
            media_file: None,
            media_type: None,
        });
        let delivered = self.send_to(target, &message).await;
        debug!(from = from.0, to = target.0, delivered, "relay: chat message");
        // The sender sees its own message through the echo.
        self.send_to(from, &message).await;
    }

    async fn relay_signal(&self, from: UserId, frame: IncomingFrame) {
        let Some(target) = frame.target_id else {
            self.send_error(
                from,
                "Failed to relay signal",
                Some("Target user ID is required".to_string()),
            )
            .await;
            return;
        };
        let signal = match frame
            .signal
            .map(serde_json::from_value::<SignalPayload>)
            .transpose()
        {
            Ok(Some(signal)) => signal,
            Ok(None) => {
                self.send_error(from, "Failed to relay signal", Some("signal is required".to_string()))
                    .await;
                return;
            }
            Err(err) => {
                self.send_error(from, "Failed to relay signal", Some(err.to_string()))
                    .await;
                return;
            }
        };
        let kind = signal.label();
        let delivered = self
            .send_to(
                target,
                &InboundFrame::Signal {
                    from_user: from,
                    signal,
                },
            )
            .await;
        debug!(from = from.0, to = target.0, kind, delivered, "relay: signal");
    }

    async fn send_error(&self, to: UserId, message: &str, details: Option<String>) {
        self.send_to(
            to,
            &InboundFrame::Error {
                message: message.to_string(),
                details,
            },
        )
        .await;
    }

    async fn broadcast_status(&self, user_id: UserId, status: UserStatus) {
        let Some(text) = encode(&InboundFrame::Status {
            user_id,
            status,
            timestamp: Some(Utc::now()),
        }) else {
            return;
        };
        for peer in self.peers.read().await.values() {
            let _ = peer.tx.send(Outbound::Text(text.clone()));
        }
    }

    /// Returns false when `to` is not connected.
    async fn send_to(&self, to: UserId, frame: &InboundFrame) -> bool {
        let Some(text) = encode(frame) else {
            return false;
        };
        match self.peers.read().await.get(&to) {
            Some(peer) => peer.tx.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }
}

fn encode(frame: &InboundFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(err) => {
            error!(kind = frame.kind(), %err, "relay: failed to encode frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
