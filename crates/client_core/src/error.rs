use shared::domain::UserId;
use thiserror::Error;

use crate::signaling::CallPhase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection is not open")]
    NotConnected,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call with user {peer} is already in progress")]
    Busy { peer: UserId },
    #[error("no call is waiting for a decision")]
    NoPendingCall,
    #[error("call is {phase:?}; the requested action is not allowed")]
    InvalidPhase { phase: CallPhase },
    #[error("could not access camera/microphone: {0}")]
    Media(String),
    #[error("peer connection failed: {0}")]
    PeerConnection(String),
    #[error("call ended before the operation completed")]
    Superseded,
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("select a user to chat with first")]
    NoPeerSelected,
    #[error("message is empty")]
    EmptyMessage,
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Directory(#[from] anyhow::Error),
}
