//! Call session lifecycle management

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::machine::CallMachine;
use super::{CallPhase, Role};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::media::MediaFactory;
use crate::signaling::{CallId, SignalingStore};

struct ActiveCall {
    id: CallId,
    role: Role,
    machine: CallMachine,
}

/// Owns the lifecycle of one call end to end: role selection, start, and
/// guaranteed cleanup on every termination path.
///
/// At most one session is active per manager instance. Every failure inside
/// `start_call`/`join_call` funnels through the same teardown as
/// [`CallSessionManager::end_call`], so no media or subscription outlives a
/// failed start.
///
/// Known limitation: there is no timeout on waiting for a peer to answer.
/// An unanswered call stays in `OfferCreated` until `end_call` is invoked.
pub struct CallSessionManager {
    store: Arc<dyn SignalingStore>,
    media: Arc<dyn MediaFactory>,
    events: Arc<EventBus>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallSessionManager {
    pub fn new(
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaFactory>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            media,
            events,
            active: Mutex::new(None),
        }
    }

    /// Lifecycle event feed for UI layers
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start a call as the caller.
    ///
    /// Returns the generated id for out-of-band sharing with the callee;
    /// `call-ready-to-share` carries the same id for UI layers.
    pub async fn start_call(&self) -> Result<CallId> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::CallInProgress);
        }

        let endpoint = self.media.create_endpoint().await.map_err(|e| {
            self.events.publish(CallEvent::error(e.kind(), e.to_string()));
            e
        })?;
        let machine = CallMachine::new(
            Role::Caller,
            self.store.clone(),
            endpoint,
            self.events.clone(),
        );

        let started = async {
            machine.acquire_media().await?;
            machine.run_caller().await
        }
        .await;

        match started {
            Ok(id) => {
                info!(call_id = %id, "call started as caller");
                *active = Some(ActiveCall {
                    id: id.clone(),
                    role: Role::Caller,
                    machine,
                });
                self.events
                    .publish(CallEvent::CallStarted { call_id: id.clone() });
                self.events
                    .publish(CallEvent::CallReadyToShare { call_id: id.clone() });
                Ok(id)
            }
            Err(e) => {
                self.abort_start(machine, &e).await;
                Err(e)
            }
        }
    }

    /// Join a call as the callee with an id received out-of-band.
    ///
    /// An empty id is rejected before any I/O; an unknown id fails with
    /// `CallNotFound` after the already-acquired media has been released.
    pub async fn join_call(&self, raw_id: &str) -> Result<()> {
        // validate before any I/O
        let id = CallId::parse(raw_id)?;

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CallError::CallInProgress);
        }

        let endpoint = self.media.create_endpoint().await.map_err(|e| {
            self.events.publish(CallEvent::error(e.kind(), e.to_string()));
            e
        })?;
        let machine = CallMachine::new(
            Role::Callee,
            self.store.clone(),
            endpoint,
            self.events.clone(),
        );

        let joined = async {
            machine.acquire_media().await?;
            machine.run_callee(&id).await
        }
        .await;

        match joined {
            Ok(()) => {
                info!(call_id = %id, "call joined as callee");
                *active = Some(ActiveCall {
                    id: id.clone(),
                    role: Role::Callee,
                    machine,
                });
                self.events.publish(CallEvent::CallStarted { call_id: id });
                Ok(())
            }
            Err(e) => {
                self.abort_start(machine, &e).await;
                Err(e)
            }
        }
    }

    /// Tear the active session down: cancel subscriptions, release media,
    /// delete the call record. Idempotent, and safe with no active call.
    pub async fn end_call(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(call) = active.take() else {
            return Ok(());
        };

        call.machine.close().await;

        let result = match self.store.delete_call(&call.id).await {
            // a record already removed by the peer is a benign race
            Err(e) if e.is_stale_write() => Ok(()),
            other => other,
        };

        info!(call_id = %call.id, role = %call.role, "call ended");
        self.events
            .publish(CallEvent::CallEnded { call_id: call.id });
        result
    }

    /// Id and role of the active session, if any
    pub async fn current_call(&self) -> Option<(CallId, Role)> {
        let active = self.active.lock().await;
        active.as_ref().map(|call| (call.id.clone(), call.role))
    }

    /// Phase feed of the active session, if any
    pub async fn phase_watch(&self) -> Option<watch::Receiver<CallPhase>> {
        let active = self.active.lock().await;
        active.as_ref().map(|call| call.machine.phase_watch())
    }

    /// Shared cleanup for failed starts: same path as `end_call`, minus the
    /// active-slot bookkeeping (the session was never registered).
    async fn abort_start(&self, machine: CallMachine, error: &CallError) {
        warn!("call start failed, cleaning up: {error}");
        self.events
            .publish(CallEvent::error(error.kind(), error.to_string()));

        machine.close().await;

        // a caller may have created the record before failing; callees never
        // own the record, so their machines carry no id worth deleting here
        if machine.role() == Role::Caller {
            if let Some(id) = machine.call_id() {
                if let Err(e) = self.store.delete_call(&id).await {
                    if !e.is_stale_write() {
                        warn!(call_id = %id, "record cleanup failed: {e}");
                    }
                }
            }
        }
    }
}
