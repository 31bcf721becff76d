use thiserror::Error;

use crate::signaling::CallId;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Signaling store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Invalid call id: {0}")]
    InvalidCallId(String),

    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),

    #[error("Stale write against call {0}")]
    StaleWrite(CallId),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Stable tag carried in the `error` lifecycle event so UI layers can
    /// dispatch on the kind without parsing display text.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::MediaUnavailable(_) => "media-unavailable",
            CallError::StoreUnavailable(_) => "store-unavailable",
            CallError::CallNotFound(_) => "call-not-found",
            CallError::InvalidCallId(_) => "invalid-call-id",
            CallError::NegotiationFailure(_) => "negotiation-failure",
            CallError::StaleWrite(_) => "stale-write",
            CallError::CallInProgress => "call-in-progress",
            CallError::Internal(_) => "internal",
        }
    }

    /// Stale writes are benign races with the peer's cleanup; they are
    /// swallowed during teardown rather than surfaced.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, CallError::StaleWrite(_))
    }
}

/// Result type alias for call operations
pub type Result<T> = std::result::Result<T, CallError>;
