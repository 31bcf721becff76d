//! Supplied media capability behind a narrow seam
//!
//! The core orchestrates description and candidate exchange; it does not
//! reimplement the transport. [`MediaEndpoint`] is the narrow interface the
//! call state machine drives: create/apply local descriptions, apply remote
//! ones, feed remote candidates in, and observe local candidates, remote
//! tracks, and connectivity progress as event streams. [`RtcEndpoint`] is
//! the production implementation over the `webrtc` crate.

pub mod rtc;

#[cfg(test)]
pub(crate) mod mock;

pub use rtc::{RtcConfig, RtcEndpoint, RtcFactory, TurnServer};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};

/// Connectivity state reported by the peer-connection capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Failed` is the only state the capability cannot recover from
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// A remote media track announced by the capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind ("audio" or "video")
    pub kind: String,
}

/// One peer-connection endpoint, exclusively owned by one call session.
///
/// Created at call start and released at call end, never a process-wide
/// singleton, so a process can host independent sessions.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Capture local media and attach its tracks to the connection.
    ///
    /// Fails with `MediaUnavailable` when capture devices are denied or
    /// absent; no partial session survives that failure.
    async fn start_local_media(&self) -> Result<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and apply it as the local description.
    ///
    /// Valid only after a remote offer has been applied.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the peer's description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Whether a remote description has been applied.
    ///
    /// Guards against duplicate answer snapshots and candidates that arrive
    /// before a remote description exists.
    async fn has_remote_description(&self) -> bool;

    /// Apply a remote connectivity candidate.
    ///
    /// Fails with `NegotiationFailure` when the capability rejects it.
    /// Re-applying an already-applied candidate must not raise.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Feed of locally discovered candidates.
    ///
    /// Subscribe before creating the local description so that nothing
    /// gathered during negotiation is missed.
    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate>;

    /// Feed of remote tracks as they are received
    fn remote_tracks(&self) -> broadcast::Receiver<RemoteTrack>;

    /// Connectivity state, current value plus changes
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Stop local media and release the peer connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Creates one endpoint per call
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>>;
}
