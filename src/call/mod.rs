//! Call orchestration: negotiation state machine and session lifecycle

pub mod machine;
pub mod session;

pub use machine::CallMachine;
pub use session::CallSessionManager;

use serde::{Deserialize, Serialize};

use crate::signaling::Direction;

/// Which side of the call this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The candidate direction this side writes
    pub fn local_direction(self) -> Direction {
        match self {
            Role::Caller => Direction::Offer,
            Role::Callee => Direction::Answer,
        }
    }

    /// The candidate direction this side consumes
    pub fn remote_direction(self) -> Direction {
        self.local_direction().opposite()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Caller => write!(f, "caller"),
            Role::Callee => write!(f, "callee"),
        }
    }
}

/// Local session phase.
///
/// Transitions are monotonic in declaration order, except `Closed`, which is
/// terminal and reachable from any phase. A session passes through either
/// `OfferCreated` (caller) or `AnswerCreated` (callee), never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    CapturingMedia,
    OfferCreated,
    AnswerCreated,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallPhase::Idle => write!(f, "idle"),
            CallPhase::CapturingMedia => write!(f, "capturing-media"),
            CallPhase::OfferCreated => write!(f, "offer-created"),
            CallPhase::AnswerCreated => write!(f, "answer-created"),
            CallPhase::Negotiating => write!(f, "negotiating"),
            CallPhase::Connected => write!(f, "connected"),
            CallPhase::Closed => write!(f, "closed"),
        }
    }
}
