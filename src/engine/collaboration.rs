// Collaboration service: locks, UI events and push delivery for canvas sessions

//! # Collaboration Service
//!
//! The entry point a transport layer talks to. It ties together the [`LockManager`], the
//! [`BroadcastRegistry`] and the [`CanvasStateStore`]:
//!
//! - lock operations, with a `lock_status` push to the canvas on every lock transition
//! - UI events (selection, editing, navigation, annotation), echoed to the canvas
//! - undo/redo and annotation maintenance
//! - client connect/disconnect, where disconnect releases the session's locks
//!
//! ## Editing and Locks
//!
//! An edit on an object locked by another session is rejected. If the object is unlocked,
//! the lock is taken for the editing session before the edit is applied, and released again
//! if applying the edit fails.
//!
//! ## Broadcast Ordering
//!
//! Each canvas has a publish gate (a mutex). Any operation that changes locks on a canvas
//! holds that canvas's gate from the lock-table change until its `lock_status` messages are
//! pushed, so every client of the canvas sees lock transitions in the order they happened.
//! Operations spanning several canvases (session release, sweep) take their gates in sorted
//! canvas order, which rules out lock-order deadlocks between them.
//!
//! A gate is dropped again once its canvas has neither locks nor clients and no operation
//! holds it, so the gate map only covers canvases in use.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::engine::broadcast::{BroadcastRegistry, ClientInfo, ClientRegistration};
use crate::engine::canvas::{Annotation, CanvasStateStore, NavigationState, SelectionState};
use crate::engine::locks::{LockManager, LockSnapshot};
use crate::models::{
    EditingPayload, LockInfo, LockOutcome, LockStatus, PushMessage, ReleasedLocks, UiEvent,
    UiPayload, UnlockOutcome,
};
use crate::Result;

/// Event type of lock transition pushes
pub const LOCK_STATUS_EVENT: &str = "lock_status";

type Gate = Arc<Mutex<()>>;

/// Façade over locks, canvas UI state and client push channels
#[derive(Clone)]
pub struct CollaborationService {
    locks: Arc<LockManager>,
    registry: Arc<BroadcastRegistry>,
    canvases: Arc<CanvasStateStore>,
    gates: Arc<DashMap<String, Gate>>,
}

impl CollaborationService {
    pub fn new(
        locks: Arc<LockManager>,
        registry: Arc<BroadcastRegistry>,
        canvases: Arc<CanvasStateStore>,
    ) -> Self {
        Self {
            locks,
            registry,
            canvases,
            gates: Arc::new(DashMap::new()),
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn registry(&self) -> &BroadcastRegistry {
        &self.registry
    }

    pub fn canvases(&self) -> &CanvasStateStore {
        &self.canvases
    }

    fn gate(&self, canvas_id: &str) -> Gate {
        self.gates
            .entry(canvas_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the publish gate of one canvas
    fn with_gate<R>(&self, canvas_id: &str, f: impl FnOnce() -> R) -> R {
        let result = {
            let gate = self.gate(canvas_id);
            let _guard = lock_gate(&gate);
            f()
        };
        self.prune_gate(canvas_id);
        result
    }

    /// Run `f` while holding the gates of several canvases, taken in sorted canvas order
    fn with_gates<R>(&self, canvases: &BTreeSet<String>, f: impl FnOnce() -> R) -> R {
        let result = {
            let gates: Vec<Gate> = canvases.iter().map(|canvas| self.gate(canvas)).collect();
            let _guards: Vec<MutexGuard<'_, ()>> = gates.iter().map(lock_gate).collect();
            f()
        };
        for canvas in canvases {
            self.prune_gate(canvas);
        }
        result
    }

    /// Forget the gate of an idle canvas
    ///
    /// Only the map may still reference the gate: a holder or waiter keeps a clone, and `gate`
    /// clones under the same shard lock `remove_if` takes.
    fn prune_gate(&self, canvas_id: &str) {
        if self.locks.has_locks(canvas_id) || self.registry.has_clients(canvas_id) {
            return;
        }
        if self
            .gates
            .remove_if(canvas_id, |_, gate| Arc::strong_count(gate) == 1)
            .is_some()
        {
            debug!(canvas_id, "dropped publish gate of idle canvas");
        }
    }

    pub(crate) fn gate_count(&self) -> usize {
        self.gates.len()
    }

    fn push_lock_status(&self, status: &str, info: &LockInfo, locked: bool) {
        let message = PushMessage::new(
            status,
            LOCK_STATUS_EVENT,
            json!({
                "canvas_id": info.canvas_id,
                "object_id": info.object_id,
                "locked": locked,
                "session_id": info.session_id,
                "user_id": info.user_id,
                "expires_at": info.expires_at,
            }),
        );
        self.registry.broadcast(&info.canvas_id, &message);
    }

    // ----- locks -----

    /// Lock an object for a session and tell the canvas about it
    pub fn lock(&self, canvas_id: &str, object_id: &str, session_id: &str, user_id: &str) -> LockOutcome {
        self.with_gate(canvas_id, || self.lock_gated(canvas_id, object_id, session_id, user_id))
    }

    fn lock_gated(&self, canvas_id: &str, object_id: &str, session_id: &str, user_id: &str) -> LockOutcome {
        let (_, expired) = self.locks.check_lock(canvas_id, object_id);
        if let Some(expired) = expired {
            self.push_lock_status("expired", &expired, false);
        }

        // Re-acquiring an already held lock is not a transition
        let (outcome, created) = self.locks.acquire(canvas_id, object_id, session_id, user_id);
        if let (LockOutcome::Acquired { lock_info }, true) = (&outcome, created) {
            self.push_lock_status("locked", lock_info, true);
        }
        outcome
    }

    pub fn unlock(&self, canvas_id: &str, object_id: &str, session_id: &str) -> UnlockOutcome {
        self.with_gate(canvas_id, || self.unlock_gated(canvas_id, object_id, session_id))
    }

    fn unlock_gated(&self, canvas_id: &str, object_id: &str, session_id: &str) -> UnlockOutcome {
        let (_, expired) = self.locks.check_lock(canvas_id, object_id);
        if let Some(expired) = expired {
            self.push_lock_status("expired", &expired, false);
        }

        let outcome = self.locks.unlock_object(canvas_id, object_id, session_id);
        if let UnlockOutcome::Released { lock_info } = &outcome {
            self.push_lock_status("unlocked", lock_info, false);
        }
        outcome
    }

    /// Status of a lock; an expired lock is removed and its expiry pushed to the canvas
    pub fn lock_status(&self, canvas_id: &str, object_id: &str) -> LockStatus {
        self.with_gate(canvas_id, || {
            let (status, expired) = self.locks.check_lock(canvas_id, object_id);
            if let Some(expired) = expired {
                self.push_lock_status("expired", &expired, false);
            }
            status
        })
    }

    /// Release every lock of a session, pushing an unlock per released lock
    pub fn release_session_locks(&self, session_id: &str) -> ReleasedLocks {
        let mut released = Vec::new();

        // A session may take a lock on a new canvas while we wait for gates; go again until
        // it holds nothing.
        loop {
            let canvases = self.locks.canvases_of_session(session_id);
            if canvases.is_empty() {
                break;
            }
            let batch = self.with_gates(&canvases, || {
                let held = self.locks.locks_held_by(session_id);
                let batch = self.locks.release_session_locks_in(session_id, &canvases);
                for info in held.iter().filter(|info| batch.released.contains(&info.key())) {
                    self.push_lock_status("unlocked", info, false);
                }
                batch
            });
            released.extend(batch.released);
        }

        released.sort();
        ReleasedLocks {
            session_id: session_id.to_string(),
            count: released.len(),
            released,
        }
    }

    /// Remove expired locks and push their expiry to the affected canvases
    pub fn sweep_expired(&self) -> Vec<LockInfo> {
        let canvases = self.locks.canvases_with_expired_locks();
        if canvases.is_empty() {
            return Vec::new();
        }
        self.with_gates(&canvases, || {
            let expired = self.locks.sweep_canvases(&canvases);
            for info in &expired {
                self.push_lock_status("expired", info, false);
            }
            expired
        })
    }

    pub fn all_locks(&self, canvas_id: Option<&str>) -> LockSnapshot {
        self.locks.get_all_locks(canvas_id)
    }

    pub fn set_lock_timeout(&self, seconds: u64) -> Result<()> {
        self.locks.set_lock_timeout(seconds)
    }

    pub fn get_lock_timeout(&self) -> u64 {
        self.locks.get_lock_timeout()
    }

    // ----- UI events -----

    /// Apply a UI event and echo the enriched result to the canvas
    ///
    /// Edits rejected because of another session's lock come back as a `rejected` message
    /// and are not broadcast. Malformed events are errors.
    pub fn handle_ui_event(&self, event: UiEvent) -> Result<PushMessage> {
        let event_type = event.event_type();
        debug!(canvas_id = %event.canvas_id, session_id = %event.session_id, event_type, "ui event");

        let message = match &event.payload {
            UiPayload::Selection(payload) => {
                let selection = self.canvases.apply_selection(
                    &event.canvas_id,
                    &event.session_id,
                    &event.user_id,
                    payload,
                    event.timestamp,
                );
                PushMessage::new("updated", event_type, serde_json::to_value(selection)?)
            }
            UiPayload::Editing(payload) => return self.handle_edit(&event, payload),
            UiPayload::Navigation(payload) => {
                let navigation =
                    self.canvases
                        .apply_navigation(&event.canvas_id, &event.user_id, payload, event.timestamp);
                PushMessage::new("navigation_updated", event_type, serde_json::to_value(navigation)?)
            }
            UiPayload::Annotation(payload) => {
                let (index, annotation) =
                    self.canvases
                        .add_annotation(&event.canvas_id, &event.user_id, payload, event.timestamp)?;
                PushMessage::new(
                    "annotation_added",
                    event_type,
                    json!({
                        "target_id": payload.target_id,
                        "annotation_index": index,
                        "annotation": serde_json::to_value(annotation)?,
                    }),
                )
            }
        };

        self.registry.broadcast(&event.canvas_id, &message);
        Ok(message)
    }

    fn handle_edit(&self, event: &UiEvent, payload: &EditingPayload) -> Result<PushMessage> {
        self.with_gate(&event.canvas_id, || self.handle_edit_gated(event, payload))
    }

    fn handle_edit_gated(&self, event: &UiEvent, payload: &EditingPayload) -> Result<PushMessage> {
        let canvas_id = event.canvas_id.as_str();
        let target_id = payload.target_id.as_str();

        let (status, expired) = self.locks.check_lock(canvas_id, target_id);
        if let Some(expired) = expired {
            self.push_lock_status("expired", &expired, false);
        }

        let holder = status.session_id.clone();
        if status.locked && holder.as_deref() != Some(event.session_id.as_str()) {
            info!(canvas_id, target_id, requester = %event.session_id, holder = ?holder, "edit rejected, object locked");
            return Ok(rejected(event, status));
        }

        let auto_locked = !status.locked;
        if auto_locked {
            if let LockOutcome::Conflict { lock_info } =
                self.lock_gated(canvas_id, target_id, &event.session_id, &event.user_id)
            {
                let status = LockStatus::locked(&lock_info, self.locks.now());
                return Ok(rejected(event, status));
            }
        }

        match self.canvases.apply_edit(
            canvas_id,
            &event.session_id,
            &event.user_id,
            payload,
            event.timestamp,
        ) {
            Ok(record) => {
                let message = PushMessage::new(
                    "edited",
                    event.event_type(),
                    json!({
                        "edit": serde_json::to_value(record)?,
                        "auto_locked": auto_locked,
                    }),
                );
                self.registry.broadcast(canvas_id, &message);
                Ok(message)
            }
            Err(e) => {
                if auto_locked {
                    warn!(canvas_id, target_id, error = %e, "edit failed, releasing lock");
                    self.unlock_gated(canvas_id, target_id, &event.session_id);
                }
                Err(e)
            }
        }
    }

    /// Undo the newest edit of a canvas
    pub fn perform_undo(&self, canvas_id: &str) -> Result<PushMessage> {
        match self.canvases.undo(canvas_id) {
            Some(record) => {
                let message = PushMessage::new("undone", "undo", json!({ "edit": serde_json::to_value(record)? }));
                self.registry.broadcast(canvas_id, &message);
                Ok(message)
            }
            None => Ok(PushMessage::new("nothing_to_undo", "undo", json!({ "canvas_id": canvas_id }))),
        }
    }

    /// Re-apply the most recently undone edit of a canvas
    pub fn perform_redo(&self, canvas_id: &str) -> Result<PushMessage> {
        match self.canvases.redo(canvas_id) {
            Some(record) => {
                let message = PushMessage::new("redone", "redo", json!({ "edit": serde_json::to_value(record)? }));
                self.registry.broadcast(canvas_id, &message);
                Ok(message)
            }
            None => Ok(PushMessage::new("nothing_to_redo", "redo", json!({ "canvas_id": canvas_id }))),
        }
    }

    pub fn update_annotation(
        &self,
        canvas_id: &str,
        target_id: &str,
        index: usize,
        changes: &Value,
    ) -> Result<PushMessage> {
        let annotation = self
            .canvases
            .update_annotation(canvas_id, target_id, index, changes, self.locks.now())?;
        let message = PushMessage::new(
            "annotation_updated",
            "annotation_update",
            json!({
                "target_id": target_id,
                "annotation_index": index,
                "annotation": serde_json::to_value(annotation)?,
            }),
        );
        self.registry.broadcast(canvas_id, &message);
        Ok(message)
    }

    pub fn delete_annotation(&self, canvas_id: &str, target_id: &str, index: usize) -> Result<PushMessage> {
        let removed = self.canvases.delete_annotation(canvas_id, target_id, index)?;
        let message = PushMessage::new(
            "annotation_deleted",
            "annotation_delete",
            json!({
                "target_id": target_id,
                "annotation_index": index,
                "annotation": serde_json::to_value(removed)?,
            }),
        );
        self.registry.broadcast(canvas_id, &message);
        Ok(message)
    }

    pub fn get_selection_state(&self, canvas_id: &str) -> Option<SelectionState> {
        self.canvases.get_selection_state(canvas_id)
    }

    pub fn get_navigation_state(&self, canvas_id: &str) -> Option<NavigationState> {
        self.canvases.get_navigation_state(canvas_id)
    }

    pub fn get_annotations(&self, canvas_id: &str, target_id: Option<&str>) -> BTreeMap<String, Vec<Annotation>> {
        self.canvases.get_annotations(canvas_id, target_id)
    }

    // ----- connections -----

    /// Register a client connection on a canvas
    pub fn connect(&self, canvas_id: &str, user_id: &str, session_id: &str) -> ClientRegistration {
        self.registry.register_client(canvas_id, user_id, session_id)
    }

    /// Deregister a client and release every lock its session holds
    pub fn disconnect(&self, client: &ClientInfo) -> ReleasedLocks {
        self.registry.unregister_client(&client.client_id);
        let released = self.release_session_locks(&client.session_id);
        self.prune_gate(&client.canvas_id);
        info!(
            session_id = %client.session_id,
            released = released.count,
            "client disconnected, session locks released"
        );
        released
    }
}

fn lock_gate(gate: &Gate) -> MutexGuard<'_, ()> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(event: &UiEvent, status: LockStatus) -> PushMessage {
    PushMessage::new(
        "rejected",
        event.event_type(),
        json!({
            "reason": "object is locked by another session",
            "canvas_id": status.canvas_id,
            "object_id": status.object_id,
            "lock_info": {
                "session_id": status.session_id,
                "user_id": status.user_id,
                "remaining_time": status.remaining_time,
            },
        }),
    )
}

impl std::fmt::Debug for CollaborationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationService")
            .field("locks", &self.locks)
            .field("clients", &self.registry.client_count())
            .finish()
    }
}
