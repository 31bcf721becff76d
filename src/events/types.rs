//! Lifecycle event types
//!
//! Defines the named events a UI layer renders. The core never formats
//! user-facing text; it only reports what happened and with which call.

use serde::{Deserialize, Serialize};

use crate::signaling::CallId;

/// Named call lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CallEvent {
    /// A local session started (either role)
    CallStarted {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// The caller's id is persisted and ready for out-of-band sharing
    CallReadyToShare {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// The media capability reported a connected state
    CallConnected {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// The local session was torn down
    CallEnded {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// A non-fatal or fatal error, tagged with a stable kind
    Error { kind: String, detail: String },
}

impl CallEvent {
    pub fn error(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}
