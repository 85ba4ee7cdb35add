use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("signal payload carries none of sdp/candidate/rejected")]
    EmptySignal,
    #[error("signal payload carries more than one of sdp/candidate/rejected: {keys}")]
    AmbiguousSignal { keys: String },
    #[error("signal `rejected` flag must be true when present")]
    RejectedFlagUnset,
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}
