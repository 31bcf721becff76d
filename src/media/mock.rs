//! Scripted media endpoint for exercising the call state machine without a
//! real peer-connection stack.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::{ConnectionState, MediaEndpoint, MediaFactory, RemoteTrack};
use crate::error::{CallError, Result};
use crate::signaling::{IceCandidate, SessionDescription};

pub(crate) struct MockEndpoint {
    fail_media: bool,
    started: AtomicBool,
    closed: AtomicBool,
    remote_description: parking_lot::Mutex<Option<SessionDescription>>,
    remote_applications: AtomicUsize,
    applied_candidates: parking_lot::Mutex<Vec<IceCandidate>>,
    candidate_tx: broadcast::Sender<IceCandidate>,
    track_tx: broadcast::Sender<RemoteTrack>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MockEndpoint {
    pub(crate) fn new(fail_media: bool) -> Arc<Self> {
        let (candidate_tx, _) = broadcast::channel(32);
        let (track_tx, _) = broadcast::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            fail_media,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_description: parking_lot::Mutex::new(None),
            remote_applications: AtomicUsize::new(0),
            applied_candidates: parking_lot::Mutex::new(vec![]),
            candidate_tx,
            track_tx,
            state_tx,
            state_rx,
        })
    }

    // ----- test drivers -----

    pub(crate) fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.candidate_tx.send(candidate);
    }

    pub(crate) fn emit_remote_track(&self, track: RemoteTrack) {
        let _ = self.track_tx.send(track);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    // ----- test observers -----

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub(crate) fn remote_applications(&self) -> usize {
        self.remote_applications.load(Ordering::SeqCst)
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }
}

#[async_trait]
impl MediaEndpoint for MockEndpoint {
    async fn start_local_media(&self) -> Result<()> {
        if self.fail_media {
            return Err(CallError::MediaUnavailable("capture denied".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote_description.lock().is_none() {
            return Err(CallError::NegotiationFailure(
                "answer requested before remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.remote_applications.fetch_add(1, Ordering::SeqCst);
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        // duplicates are applied again without raising, like the real stack
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidate_tx.subscribe()
    }

    fn remote_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.track_tx.subscribe()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out inspectable endpoints
pub(crate) struct MockFactory {
    fail_media: bool,
    pub(crate) endpoints: parking_lot::Mutex<Vec<Arc<MockEndpoint>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_media: false,
            endpoints: parking_lot::Mutex::new(vec![]),
        })
    }

    pub(crate) fn failing_media() -> Arc<Self> {
        Arc::new(Self {
            fail_media: true,
            endpoints: parking_lot::Mutex::new(vec![]),
        })
    }

    pub(crate) fn endpoint(&self, index: usize) -> Arc<MockEndpoint> {
        self.endpoints.lock()[index].clone()
    }
}

#[async_trait]
impl MediaFactory for MockFactory {
    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>> {
        let endpoint = MockEndpoint::new(self.fail_media);
        self.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }
}
