//! Converge - peer-to-peer call signaling core
//!
//! This crate coordinates a two-party WebRTC call through a replaceable
//! signaling store: the caller publishes an offer under a shareable id,
//! the callee merges in an answer, and both sides trickle connectivity
//! candidates through per-direction channels until media connects.

pub mod call;
pub mod error;
pub mod events;
pub mod media;
pub mod signaling;

pub use call::{CallPhase, CallSessionManager, Role};
pub use error::{CallError, Result};
