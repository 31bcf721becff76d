//! In-process signaling store
//!
//! Reference implementation of [`SignalingStore`] over a plain map. Used by
//! the demo binary (both peers in one process) and as the backend for every
//! higher-layer test. Push notification fans out through per-record watch
//! channels and per-direction subscriber lists.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::store::{CandidateFeed, RecordWatch, SignalingStore};
use super::{CallId, CallRecord, Direction, IceCandidate, SessionDescription};
use crate::error::{CallError, Result};

/// One direction's append-only candidate log plus its live subscribers
#[derive(Default)]
struct CandidateChannel {
    log: Vec<IceCandidate>,
    subscribers: Vec<mpsc::UnboundedSender<IceCandidate>>,
}

impl CandidateChannel {
    fn append(&mut self, candidate: IceCandidate) {
        self.log.push(candidate.clone());
        // prune subscribers that dropped their receiver
        self.subscribers
            .retain(|tx| tx.send(candidate.clone()).is_ok());
    }

    fn subscribe(&mut self) -> CandidateFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        // replay the backlog so a late joiner sees every candidate exactly
        // once, then keep the sender around for live appends
        for candidate in &self.log {
            let _ = tx.send(candidate.clone());
        }
        self.subscribers.push(tx);
        rx
    }
}

struct CallEntry {
    record: CallRecord,
    record_tx: watch::Sender<Option<CallRecord>>,
    offer_candidates: CandidateChannel,
    answer_candidates: CandidateChannel,
}

impl CallEntry {
    fn new(record: CallRecord) -> Self {
        let (record_tx, _) = watch::channel(Some(record.clone()));
        Self {
            record,
            record_tx,
            offer_candidates: CandidateChannel::default(),
            answer_candidates: CandidateChannel::default(),
        }
    }

    fn channel_mut(&mut self, direction: Direction) -> &mut CandidateChannel {
        match direction {
            Direction::Offer => &mut self.offer_candidates,
            Direction::Answer => &mut self.answer_candidates,
        }
    }
}

/// In-memory [`SignalingStore`]
///
/// Cheap to clone via `Arc`; the lock is never held across an await point.
#[derive(Default)]
pub struct MemoryStore {
    calls: RwLock<HashMap<CallId, CallEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live call records (test and monitoring aid)
    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }
}

#[async_trait::async_trait]
impl SignalingStore for MemoryStore {
    async fn create_call(&self, offer: SessionDescription) -> Result<CallId> {
        let id = CallId::generate();
        let record = CallRecord::new(id.clone(), offer);
        self.calls
            .write()
            .insert(id.clone(), CallEntry::new(record));
        debug!(call_id = %id, "call record created");
        Ok(id)
    }

    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self.calls.read().get(id).map(|entry| entry.record.clone()))
    }

    async fn set_answer(&self, id: &CallId, answer: SessionDescription) -> Result<()> {
        let mut calls = self.calls.write();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| CallError::CallNotFound(id.clone()))?;

        if entry.record.answer.is_some() {
            // first write wins; the record is never overwritten
            debug!(call_id = %id, "answer already present, ignoring late write");
            return Ok(());
        }

        entry.record.answer = Some(answer);
        let _ = entry.record_tx.send(Some(entry.record.clone()));
        debug!(call_id = %id, "answer merged into call record");
        Ok(())
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        direction: Direction,
        candidate: IceCandidate,
    ) -> Result<()> {
        let mut calls = self.calls.write();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| CallError::CallNotFound(id.clone()))?;
        entry.channel_mut(direction).append(candidate);
        Ok(())
    }

    async fn watch_call(&self, id: &CallId) -> Result<RecordWatch> {
        let calls = self.calls.read();
        let entry = calls
            .get(id)
            .ok_or_else(|| CallError::CallNotFound(id.clone()))?;
        Ok(entry.record_tx.subscribe())
    }

    async fn watch_candidates(&self, id: &CallId, direction: Direction) -> Result<CandidateFeed> {
        let mut calls = self.calls.write();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| CallError::CallNotFound(id.clone()))?;
        Ok(entry.channel_mut(direction).subscribe())
    }

    async fn delete_call(&self, id: &CallId) -> Result<()> {
        if let Some(entry) = self.calls.write().remove(id) {
            // watchers see the deletion before the sender is dropped
            let _ = entry.record_tx.send(None);
            debug!(call_id = %id, "call record deleted");
        }
        Ok(())
    }
}
