use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{MessageId, MessageType, StoredMessage, UserId, UserStatus},
    error::ProtocolError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Negotiated media capabilities, shaped like the browser's
/// `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// The body of a `webrtc-signal` frame. Exactly one of `sdp`, `candidate`
/// or `rejected` is present on the wire; anything else fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSignal", into = "RawSignal")]
pub enum SignalPayload {
    SessionOffer(SessionDescription),
    SessionAnswer(SessionDescription),
    IceCandidate(IceCandidate),
    Rejected,
}

impl SignalPayload {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SessionOffer(_) => "offer",
            Self::SessionAnswer(_) => "answer",
            Self::IceCandidate(_) => "candidate",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rejected: Option<bool>,
}

impl TryFrom<RawSignal> for SignalPayload {
    type Error = ProtocolError;

    fn try_from(raw: RawSignal) -> Result<Self, Self::Error> {
        let present: Vec<&str> = [
            raw.sdp.as_ref().map(|_| "sdp"),
            raw.candidate.as_ref().map(|_| "candidate"),
            raw.rejected.as_ref().map(|_| "rejected"),
        ]
        .into_iter()
        .flatten()
        .collect();

        if present.len() > 1 {
            return Err(ProtocolError::AmbiguousSignal {
                keys: present.join(","),
            });
        }

        match (raw.sdp, raw.candidate, raw.rejected) {
            (Some(desc), None, None) => Ok(match desc.kind {
                SdpKind::Offer => Self::SessionOffer(desc),
                SdpKind::Answer => Self::SessionAnswer(desc),
            }),
            (None, Some(candidate), None) => Ok(Self::IceCandidate(candidate)),
            (None, None, Some(true)) => Ok(Self::Rejected),
            (None, None, Some(false)) => Err(ProtocolError::RejectedFlagUnset),
            _ => Err(ProtocolError::EmptySignal),
        }
    }
}

impl From<SignalPayload> for RawSignal {
    fn from(payload: SignalPayload) -> Self {
        match payload {
            SignalPayload::SessionOffer(desc) | SignalPayload::SessionAnswer(desc) => Self {
                sdp: Some(desc),
                ..Self::default()
            },
            SignalPayload::IceCandidate(candidate) => Self {
                candidate: Some(candidate),
                ..Self::default()
            },
            SignalPayload::Rejected => Self {
                rejected: Some(true),
                ..Self::default()
            },
        }
    }
}

/// Frames the client writes to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "message")]
    Message {
        target_id: UserId,
        #[serde(default)]
        content: String,
        #[serde(default)]
        message_type: MessageType,
    },
    #[serde(rename = "webrtc-signal")]
    Signal {
        target_id: UserId,
        signal: SignalPayload,
    },
}

impl ClientFrame {
    pub fn text(target_id: UserId, content: impl Into<String>) -> Self {
        Self::Message {
            target_id,
            content: content.into(),
            message_type: MessageType::Text,
        }
    }

    pub fn signal(target_id: UserId, signal: SignalPayload) -> Self {
        Self::Signal { target_id, signal }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from_user: UserId,
    pub to_user: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl ChatMessage {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.from_user == user_id || self.to_user == user_id
    }
}

impl From<StoredMessage> for ChatMessage {
    fn from(stored: StoredMessage) -> Self {
        Self {
            from_user: stored.sender_id,
            to_user: stored.receiver_id,
            content: stored.content.unwrap_or_default(),
            message_type: stored.message_type,
            timestamp: stored.created_at,
            id: Some(stored.id),
            media_type: match (&stored.media_file, stored.message_type) {
                (Some(_), MessageType::Video) => Some("video/webm".to_string()),
                (Some(_), MessageType::Voice) => Some("audio/webm".to_string()),
                _ => None,
            },
            media_file: stored.media_file,
        }
    }
}

/// Frames the relay delivers to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "message")]
    Chat(ChatMessage),
    #[serde(rename = "status")]
    Status {
        user_id: UserId,
        status: UserStatus,
        #[serde(
            default,
            deserialize_with = "lenient_timestamp",
            skip_serializing_if = "Option::is_none"
        )]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    #[serde(rename = "webrtc-signal")]
    Signal {
        from_user: UserId,
        signal: SignalPayload,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "message",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Signal { .. } => "webrtc-signal",
            Self::Unknown => "unknown",
        }
    }
}

/// Accepts RFC 3339 as well as the naive ISO-8601 timestamps some relays
/// emit (treated as UTC). Unparseable values become `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
