//! The rendezvous store abstraction
//!
//! A [`SignalingStore`] combines one [`CallRecord`] and two append-only
//! candidate channels under a single call id, with point reads, merge
//! writes, and push-based change notification. The backing transport is
//! replaceable (the reference backend is [`super::MemoryStore`]; a document
//! database with live queries fits the same contract).

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{CallId, CallRecord, Direction, IceCandidate, SessionDescription};
use crate::error::Result;

/// Live feed of record snapshots.
///
/// Carries the current record and every subsequent mutation; a `None`
/// snapshot signals deletion. Delivery is at-least-once: the same snapshot
/// may be observed repeatedly, so consumers must be idempotent. Dropping
/// the receiver cancels the subscription.
pub type RecordWatch = watch::Receiver<Option<CallRecord>>;

/// Live feed of one direction's candidates, in append order.
///
/// Dropping the receiver cancels the subscription.
pub type CandidateFeed = mpsc::UnboundedReceiver<IceCandidate>;

/// Rendezvous point for exactly two peers negotiating one call.
///
/// Writes are partitioned by construction: the caller writes the offer and
/// the `Offer` candidate direction, the callee writes the answer and the
/// `Answer` direction. No operation requires cross-party locking.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Allocate a new call record holding `offer` and return its id.
    ///
    /// Fails with `StoreUnavailable` if the backing transport cannot be
    /// reached.
    async fn create_call(&self, offer: SessionDescription) -> Result<CallId>;

    /// Point read; `Ok(None)` when no such call exists.
    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>>;

    /// Merge an answer into an existing record without disturbing the offer.
    ///
    /// Fails with `CallNotFound` if the record no longer exists (race with
    /// caller cleanup). If an answer is already present the first write
    /// wins and this call is a no-op.
    async fn set_answer(&self, id: &CallId, answer: SessionDescription) -> Result<()>;

    /// Append a candidate to the named direction channel.
    ///
    /// Duplicates are stored and delivered as-is; deduplication is the
    /// consumer's responsibility.
    async fn append_candidate(
        &self,
        id: &CallId,
        direction: Direction,
        candidate: IceCandidate,
    ) -> Result<()>;

    /// Subscribe to record snapshots for `id`.
    ///
    /// Fails with `CallNotFound` if the call does not exist.
    async fn watch_call(&self, id: &CallId) -> Result<RecordWatch>;

    /// Subscribe to one direction's candidates.
    ///
    /// Delivers the backlog already appended (each exactly once to this
    /// subscriber) followed by every subsequent append, preserving append
    /// order within the direction. Ordering across directions is
    /// unspecified. Fails with `CallNotFound` if the call does not exist.
    async fn watch_candidates(&self, id: &CallId, direction: Direction) -> Result<CandidateFeed>;

    /// Remove the record and both candidate channels.
    ///
    /// Idempotent: deleting a nonexistent id is not an error. Active record
    /// watchers observe a final `None` snapshot.
    async fn delete_call(&self, id: &CallId) -> Result<()>;
}
