//! Call signaling data model and rendezvous store
//!
//! Two peers that cannot reach each other directly coordinate a call by
//! writing to and watching a shared [`SignalingStore`]: the caller creates a
//! [`CallRecord`] holding its offer, the callee merges in the answer, and
//! each side streams its connectivity candidates into its own append-only
//! channel. Everything here is transport-agnostic; [`MemoryStore`] is the
//! in-process reference backend.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{CandidateFeed, RecordWatch, SignalingStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Opaque call identifier, generated by the caller and shared out-of-band
/// (URL parameter, clipboard, ...) with the callee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh unique id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept an externally supplied id.
    ///
    /// The only validity requirement is non-emptiness; validation happens
    /// before any I/O so a blank id never reaches the store.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CallError::InvalidCallId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which half of the description exchange a payload is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Session description half (offer or answer)
///
/// Wire shape is `{type, sdp}`, matching what peer-connection stacks emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP content, opaque to the signaling layer
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

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Which per-direction candidate channel a candidate belongs to.
///
/// `Offer` holds candidates proposed by the caller, `Answer` those proposed
/// by the callee. Each party writes only its own direction, so the channels
/// are single-writer by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Offer,
    Answer,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Offer => Direction::Answer,
            Direction::Answer => Direction::Offer,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Offer => write!(f, "offerCandidates"),
            Direction::Answer => write!(f, "answerCandidates"),
        }
    }
}

/// The shared mutable document coordinating one call's offer/answer.
///
/// The caller owns creation and the offer field; the callee owns the answer
/// field. Neither field is ever overwritten once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call identifier (store key)
    pub id: CallId,
    /// Offer, set once at creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    /// Answer, merged in by the callee at most once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Creation timestamp
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(id: CallId, offer: SessionDescription) -> Self {
        Self {
            id,
            offer: Some(offer),
            answer: None,
            created_at: Utc::now(),
        }
    }

    /// A record with no answer represents a call awaiting a callee
    pub fn awaiting_answer(&self) -> bool {
        self.offer.is_some() && self.answer.is_none()
    }
}
