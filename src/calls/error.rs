//! Call-related error types.

use thiserror::Error;

use crate::types::call::CallId;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no active call")]
    NoActiveCall,

    #[error("another call is already in progress: {0}")]
    CallInProgress(CallId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("no buffered offer for incoming call {0}")]
    PendingOfferMissing(CallId),

    #[error("malformed signaling payload: {0}")]
    Parse(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("media engine error: {0}")]
    Media(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call session closed")]
    SessionClosed,
}
