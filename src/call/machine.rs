//! Call negotiation state machine
//!
//! Drives one locally owned [`MediaEndpoint`] through the caller or callee
//! path: local descriptions and candidates flow out to the
//! [`SignalingStore`], remote updates flow back into the endpoint. All
//! store and media notifications are consumed by pump tasks owned by the
//! machine; teardown aborts every pump before anything else so no handler
//! can fire against a closing session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CallPhase, Role};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::media::{ConnectionState, MediaEndpoint};
use crate::signaling::store::{CandidateFeed, RecordWatch};
use crate::signaling::{CallId, IceCandidate, SignalingStore};

/// Negotiation state machine for one call.
///
/// Created per call and per role; the endpoint it drives is exclusively
/// owned by this session. Duplicate store deliveries are tolerated: an
/// answer is applied only while no remote description exists, and
/// re-applied candidates must not raise in the capability.
pub struct CallMachine {
    shared: Arc<Shared>,
}

struct Shared {
    role: Role,
    call_id: parking_lot::RwLock<Option<CallId>>,
    store: Arc<dyn SignalingStore>,
    media: Arc<dyn MediaEndpoint>,
    events: Arc<EventBus>,
    phase_tx: watch::Sender<CallPhase>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CallMachine {
    pub fn new(
        role: Role,
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaEndpoint>,
        events: Arc<EventBus>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CallPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                role,
                call_id: parking_lot::RwLock::new(None),
                store,
                media,
                events,
                phase_tx,
                tasks: parking_lot::Mutex::new(vec![]),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Id of the call this machine negotiates, once known
    pub fn call_id(&self) -> Option<CallId> {
        self.shared.call_id.read().clone()
    }

    pub fn phase(&self) -> CallPhase {
        *self.shared.phase_tx.borrow()
    }

    /// Current phase plus subsequent transitions
    pub fn phase_watch(&self) -> watch::Receiver<CallPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Capture local media through the endpoint
    pub async fn acquire_media(&self) -> Result<()> {
        self.shared.advance(CallPhase::CapturingMedia);
        self.shared.media.start_local_media().await
    }

    /// Caller path: publish an offer under a freshly allocated id, then
    /// watch for the answer and the callee's candidates.
    pub async fn run_caller(&self) -> Result<CallId> {
        let shared = &self.shared;

        // subscribe before the offer exists so no gathered candidate is
        // missed; nothing is appended until the id is allocated below
        let local_candidates = shared.media.local_candidates();

        let offer = shared.media.create_offer().await?;
        let id = shared.store.create_call(offer).await?;
        *shared.call_id.write() = Some(id.clone());
        info!(call_id = %id, "offer published, awaiting answer");
        shared.advance(CallPhase::OfferCreated);

        let record_watch = shared.store.watch_call(&id).await?;
        let remote_feed = shared
            .store
            .watch_candidates(&id, shared.role.remote_direction())
            .await?;

        shared.spawn_local_candidate_pump(local_candidates);
        shared.spawn_record_watch(record_watch);
        shared.spawn_remote_candidate_pump(remote_feed);
        shared.spawn_connectivity_watch();

        Ok(id)
    }

    /// Callee path: read the offer under a pre-shared id, answer it, then
    /// consume the caller's candidates (backlog included).
    pub async fn run_callee(&self, id: &CallId) -> Result<()> {
        let shared = &self.shared;

        let record = shared
            .store
            .get_call(id)
            .await?
            .ok_or_else(|| CallError::CallNotFound(id.clone()))?;
        let offer = record
            .offer
            .ok_or_else(|| CallError::Internal(format!("call {id} has no offer")))?;
        *shared.call_id.write() = Some(id.clone());

        // symmetric to the caller: register before answering
        let local_candidates = shared.media.local_candidates();

        shared.media.set_remote_description(offer).await?;
        let answer = shared.media.create_answer().await?;
        shared.store.set_answer(id, answer).await?;
        info!(call_id = %id, "answer published");
        shared.advance(CallPhase::AnswerCreated);

        let remote_feed = shared
            .store
            .watch_candidates(id, shared.role.remote_direction())
            .await?;

        shared.spawn_local_candidate_pump(local_candidates);
        shared.spawn_remote_candidate_pump(remote_feed);
        shared.spawn_connectivity_watch();

        shared.advance(CallPhase::Negotiating);
        Ok(())
    }

    /// Cancel every pump, then release the endpoint. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown(false).await;
    }
}

impl Drop for CallMachine {
    fn drop(&mut self) {
        // backstop for sessions dropped without close(): pump tasks must
        // not outlive the handle that owns them
        if !self.shared.closed.load(Ordering::SeqCst) {
            for task in self.shared.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }
}

impl Shared {
    /// Monotonic phase transition; ignored once closed or when moving
    /// backwards.
    fn advance(&self, next: CallPhase) {
        self.phase_tx.send_if_modified(|phase| {
            if *phase != CallPhase::Closed && next > *phase {
                debug!(from = %phase, to = %next, "phase transition");
                *phase = next;
                true
            } else {
                false
            }
        });
    }

    fn spawn(self: &Arc<Self>, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    async fn shutdown(&self, delete_record: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // cancel subscriptions first; no callback may fire past this point
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Err(e) = self.media.close().await {
            warn!("media endpoint close failed: {e}");
        }

        if delete_record {
            // clone out before awaiting; the guard must not cross the await
            let id = self.call_id.read().clone();
            if let Some(id) = id {
                match self.store.delete_call(&id).await {
                    Err(e) if !e.is_stale_write() => {
                        warn!(call_id = %id, "record cleanup failed: {e}")
                    }
                    _ => {}
                }
            }
        }

        self.phase_tx.send_replace(CallPhase::Closed);
    }

    /// Forward locally discovered candidates into our direction channel.
    ///
    /// Best-effort: a dropped append degrades connectivity odds but is not
    /// fatal, so failures are logged and the pump keeps running.
    fn spawn_local_candidate_pump(
        self: &Arc<Self>,
        mut feed: broadcast::Receiver<IceCandidate>,
    ) {
        let shared = self.clone();
        let direction = shared.role.local_direction();
        let handle = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(candidate) => {
                        let Some(id) = shared.call_id.read().clone() else {
                            continue;
                        };
                        debug!(call_id = %id, %direction, "appending local candidate");
                        if let Err(e) = shared
                            .store
                            .append_candidate(&id, direction, candidate)
                            .await
                        {
                            warn!(call_id = %id, "local candidate append failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%missed, "local candidate feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.spawn(handle);
    }

    /// Apply the answer from record snapshots, exactly once.
    fn spawn_record_watch(self: &Arc<Self>, mut watch: RecordWatch) {
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let snapshot = watch.borrow_and_update().clone();
                match snapshot {
                    Some(record) => {
                        if let Some(answer) = record.answer {
                            if shared.media.has_remote_description().await {
                                debug!("answer already applied, ignoring snapshot");
                            } else {
                                match shared.media.set_remote_description(answer).await {
                                    Ok(()) => {
                                        info!(call_id = %record.id, "remote answer applied");
                                        shared.advance(CallPhase::Negotiating);
                                    }
                                    Err(e) => {
                                        warn!("failed to apply remote answer: {e}");
                                        shared
                                            .events
                                            .publish(CallEvent::error(e.kind(), e.to_string()));
                                    }
                                }
                            }
                        }
                    }
                    None => info!("call record deleted by peer"),
                }

                if watch.changed().await.is_err() {
                    break;
                }
            }
        });
        self.spawn(handle);
    }

    /// Apply the peer's candidates as they arrive.
    ///
    /// A candidate that cannot be applied yet (no remote description) or
    /// that the capability rejects is dropped with a logged negotiation
    /// failure; the session continues either way.
    fn spawn_remote_candidate_pump(self: &Arc<Self>, mut feed: CandidateFeed) {
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            let mut dropped = 0usize;
            while let Some(candidate) = feed.recv().await {
                if !shared.media.has_remote_description().await {
                    dropped += 1;
                    warn!(
                        %dropped,
                        "remote candidate arrived before remote description, dropping"
                    );
                    shared.events.publish(CallEvent::error(
                        "negotiation-failure",
                        "candidate received before remote description; dropped",
                    ));
                    continue;
                }

                match shared.media.add_remote_candidate(candidate).await {
                    Ok(()) => debug!("remote candidate applied"),
                    Err(e) => {
                        dropped += 1;
                        warn!(%dropped, "remote candidate rejected: {e}");
                        shared
                            .events
                            .publish(CallEvent::error(e.kind(), e.to_string()));
                    }
                }
            }
        });
        self.spawn(handle);
    }

    /// Observe connectivity progress; the machine never drives it.
    fn spawn_connectivity_watch(self: &Arc<Self>) {
        let shared = self.clone();
        let mut states = shared.media.state_watch();
        let handle = tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        shared.advance(CallPhase::Connected);
                        if let Some(id) = shared.call_id.read().clone() {
                            info!(call_id = %id, "media connected");
                            shared
                                .events
                                .publish(CallEvent::CallConnected { call_id: id });
                        }
                    }
                    ConnectionState::Disconnected => {
                        warn!("media disconnected, may recover");
                    }
                    ConnectionState::Failed => {
                        warn!("media capability reported terminal failure");
                        shared.events.publish(CallEvent::error(
                            "negotiation-failure",
                            "peer connection entered failed state",
                        ));
                        // shutdown aborts this task too, so run it detached
                        let shared = shared.clone();
                        tokio::spawn(async move { shared.shutdown(true).await });
                        break;
                    }
                    _ => {}
                }

                if states.changed().await.is_err() {
                    break;
                }
            }
        });
        self.spawn(handle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::media::mock::MockEndpoint;
    use crate::signaling::{Direction, MemoryStore, SessionDescription};

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Duration::from_secs(2);
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(deadline, poll)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2113937151 10.0.0.{n} 500{n} typ host"))
    }

    fn caller_machine(
        store: &Arc<MemoryStore>,
        endpoint: &Arc<MockEndpoint>,
        events: &Arc<EventBus>,
    ) -> CallMachine {
        CallMachine::new(
            Role::Caller,
            store.clone() as Arc<dyn SignalingStore>,
            endpoint.clone() as Arc<dyn MediaEndpoint>,
            events.clone(),
        )
    }

    #[tokio::test]
    async fn caller_publishes_offer_and_applies_answer_once() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();
        assert_eq!(machine.phase(), CallPhase::OfferCreated);

        let record = store.get_call(&id).await.unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 mock-offer")));
        assert!(record.answer.is_none());

        store
            .set_answer(&id, SessionDescription::answer("v=0 their-answer"))
            .await
            .unwrap();

        wait_until("answer applied", || endpoint.remote_applications() == 1).await;
        assert_eq!(
            endpoint.remote_description(),
            Some(SessionDescription::answer("v=0 their-answer"))
        );
        assert_eq!(machine.phase(), CallPhase::Negotiating);

        // a later snapshot (here: deletion) must not re-apply anything
        store.delete_call(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(endpoint.remote_applications(), 1);

        machine.close().await;
    }

    #[tokio::test]
    async fn caller_forwards_local_candidates_after_id_exists() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();
        let mut feed = store.watch_candidates(&id, Direction::Offer).await.unwrap();

        endpoint.emit_local_candidate(candidate(1));
        endpoint.emit_local_candidate(candidate(2));

        assert_eq!(feed.recv().await.unwrap(), candidate(1));
        assert_eq!(feed.recv().await.unwrap(), candidate(2));

        machine.close().await;
    }

    #[tokio::test]
    async fn early_remote_candidate_is_dropped_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();

        // no answer yet, so the endpoint has no remote description
        store
            .append_candidate(&id, Direction::Answer, candidate(7))
            .await
            .unwrap();

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, CallEvent::Error { ref kind, .. } if kind == "negotiation-failure"));
        assert!(endpoint.applied_candidates().is_empty());
        assert_ne!(machine.phase(), CallPhase::Closed);

        // once the answer lands, candidates flow again
        store
            .set_answer(&id, SessionDescription::answer("v=0 their-answer"))
            .await
            .unwrap();
        wait_until("answer applied", || endpoint.remote_applications() == 1).await;

        store
            .append_candidate(&id, Direction::Answer, candidate(8))
            .await
            .unwrap();
        wait_until("candidate applied", || {
            endpoint.applied_candidates() == vec![candidate(8)]
        })
        .await;

        machine.close().await;
    }

    #[tokio::test]
    async fn callee_answers_and_drains_candidate_backlog_in_order() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .create_call(SessionDescription::offer("v=0 their-offer"))
            .await
            .unwrap();
        // caller gathered candidates before the callee joined
        store
            .append_candidate(&id, Direction::Offer, candidate(1))
            .await
            .unwrap();
        store
            .append_candidate(&id, Direction::Offer, candidate(2))
            .await
            .unwrap();

        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let machine = CallMachine::new(
            Role::Callee,
            store.clone() as Arc<dyn SignalingStore>,
            endpoint.clone() as Arc<dyn MediaEndpoint>,
            events,
        );

        machine.run_callee(&id).await.unwrap();
        assert_eq!(machine.phase(), CallPhase::Negotiating);
        assert_eq!(
            endpoint.remote_description(),
            Some(SessionDescription::offer("v=0 their-offer"))
        );

        let record = store.get_call(&id).await.unwrap().unwrap();
        assert_eq!(record.answer, Some(SessionDescription::answer("v=0 mock-answer")));
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 their-offer")));

        wait_until("backlog applied", || {
            endpoint.applied_candidates() == vec![candidate(1), candidate(2)]
        })
        .await;

        // callee's own candidates land in the answer direction
        let mut feed = store.watch_candidates(&id, Direction::Answer).await.unwrap();
        endpoint.emit_local_candidate(candidate(3));
        assert_eq!(feed.recv().await.unwrap(), candidate(3));

        machine.close().await;
    }

    #[tokio::test]
    async fn callee_fails_cleanly_on_unknown_id() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let machine = CallMachine::new(
            Role::Callee,
            store.clone() as Arc<dyn SignalingStore>,
            endpoint.clone() as Arc<dyn MediaEndpoint>,
            Arc::new(EventBus::new()),
        );

        let id = CallId::parse("nonexistent-id").unwrap();
        let err = machine.run_callee(&id).await.unwrap_err();
        assert!(matches!(err, CallError::CallNotFound(_)));
        // nothing was written
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn close_cancels_pumps_before_anything_else() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();
        machine.close().await;
        assert_eq!(machine.phase(), CallPhase::Closed);

        // a candidate emitted after close never reaches the store
        let mut feed = store.watch_candidates(&id, Direction::Offer).await.unwrap();
        endpoint.emit_local_candidate(candidate(9));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(feed.try_recv().is_err());

        // closing again is a no-op
        machine.close().await;
    }

    #[tokio::test]
    async fn terminal_media_failure_tears_the_session_down() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();
        endpoint.set_state(ConnectionState::Failed);

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, CallEvent::Error { .. }));

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get_call(&id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for record deletion");
        wait_until("endpoint closed", || endpoint.is_closed()).await;
        assert_eq!(machine.phase(), CallPhase::Closed);
    }

    #[tokio::test]
    async fn connected_state_advances_phase_and_emits_event() {
        let store = Arc::new(MemoryStore::new());
        let endpoint = MockEndpoint::new(false);
        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let machine = caller_machine(&store, &endpoint, &events);

        let id = machine.run_caller().await.unwrap();
        store
            .set_answer(&id, SessionDescription::answer("v=0 their-answer"))
            .await
            .unwrap();
        wait_until("answer applied", || endpoint.remote_applications() == 1).await;

        endpoint.set_state(ConnectionState::Connecting);
        endpoint.set_state(ConnectionState::Connected);

        wait_until("phase connected", || machine.phase() == CallPhase::Connected).await;
        loop {
            if let CallEvent::CallConnected { call_id } = event_rx.recv().await.unwrap() {
                assert_eq!(call_id, id);
                break;
            }
        }

        machine.close().await;
    }
}
