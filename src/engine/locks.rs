// Per-object lock manager for collaborative editing

//! # Lock Manager
//!
//! Grants exclusive edit claims on canvas objects. Each `(canvas_id, object_id)` key is
//! either unlocked or locked by exactly one session:
//!
//! ```text
//!   Unlocked --lock_object--> Locked --unlock_object / release_session_locks / expiry--> Unlocked
//! ```
//!
//! ## Expiry
//!
//! A lock records the timeout in effect when it was acquired and stays live while
//! `now < acquired_at + timeout_seconds`. Expired locks are removed three ways:
//! - lazily, when the key is touched by `lock_object`, `unlock_object` or `get_lock_status`
//! - proactively, by [`LockManager::sweep`] (driven by the runtime's sweep loop)
//! - at read time, since `get_all_locks` filters out anything that is no longer live
//!
//! ## Rust Learning Notes:
//!
//! ### One Table, One Lock
//! The whole table lives behind a single `std::sync::RwLock`. Every public operation takes it
//! once and never calls out while holding it, so each operation is atomic with respect to
//! every other. In particular `release_session_locks` removes all of a session's locks in
//! one write section; no reader can ever observe half of a release.
//!
//! ### AtomicU64 for the Timeout
//! The process-wide timeout is read on every acquisition and written rarely, which is exactly
//! what an atomic is for.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::engine::clock::Clock;
use crate::engine::telemetry::Telemetry;
use crate::models::lock::MAX_LOCK_TIMEOUT_SECONDS;
use crate::models::{LockInfo, LockOutcome, LockStatus, ReleasedLocks, UnlockOutcome};
use crate::{CanvasRuntimeError, Result};

type LockTable = HashMap<String, HashMap<String, LockInfo>>;

/// Snapshot of live locks: canvas id -> object id -> lock
pub type LockSnapshot = BTreeMap<String, BTreeMap<String, LockInfo>>;

/// Owner of every object lock in the process
pub struct LockManager {
    locks: RwLock<LockTable>,
    timeout_seconds: AtomicU64,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
}

impl LockManager {
    pub fn new(timeout_seconds: u64, clock: Arc<dyn Clock>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            timeout_seconds: AtomicU64::new(timeout_seconds),
            clock,
            telemetry,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LockTable> {
        self.locks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LockTable> {
        self.locks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Try to lock an object for a session
    ///
    /// Re-acquiring a live lock from the same session succeeds and returns the existing
    /// record unchanged; it does not extend the lock.
    pub fn lock_object(
        &self,
        canvas_id: &str,
        object_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> LockOutcome {
        self.acquire(canvas_id, object_id, session_id, user_id).0
    }

    /// [`lock_object`](Self::lock_object), also reporting whether a new lock was created
    ///
    /// The flag is false for conflicts and for re-acquiring a lock the session already holds.
    pub(crate) fn acquire(
        &self,
        canvas_id: &str,
        object_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> (LockOutcome, bool) {
        let now = self.clock.now();
        let mut table = self.write();
        let canvas = table.entry(canvas_id.to_string()).or_default();

        if let Some(existing) = canvas.get(object_id) {
            if existing.is_live_at(now) {
                let outcome = if existing.session_id == session_id {
                    LockOutcome::Acquired {
                        lock_info: existing.clone(),
                    }
                } else {
                    debug!(canvas_id, object_id, holder = %existing.session_id, requester = session_id, "lock conflict");
                    LockOutcome::Conflict {
                        lock_info: existing.clone(),
                    }
                };
                self.telemetry.record_lock_operation(
                    "acquire",
                    if outcome.is_acquired() { "reacquired" } else { "conflict" },
                );
                return (outcome, false);
            }
            debug!(canvas_id, object_id, "replacing expired lock");
        }

        let info = LockInfo::new(
            canvas_id,
            object_id,
            session_id,
            user_id,
            now,
            self.get_lock_timeout(),
        );
        canvas.insert(object_id.to_string(), info.clone());
        info!(canvas_id, object_id, session_id, user_id, expires_at = %info.expires_at, "lock acquired");
        self.telemetry.record_lock_operation("acquire", "acquired");
        (LockOutcome::Acquired { lock_info: info }, true)
    }

    /// Release a lock held by `session_id`
    pub fn unlock_object(&self, canvas_id: &str, object_id: &str, session_id: &str) -> UnlockOutcome {
        let now = self.clock.now();
        let mut table = self.write();

        let existing = table.get(canvas_id).and_then(|c| c.get(object_id)).cloned();
        let outcome = match existing {
            None => UnlockOutcome::NotLocked,
            Some(lock_info) if lock_info.is_live_at(now) && lock_info.session_id != session_id => {
                UnlockOutcome::Denied { lock_info }
            }
            Some(lock_info) => {
                if let Some(canvas) = table.get_mut(canvas_id) {
                    canvas.remove(object_id);
                }
                prune_canvas(&mut table, canvas_id);
                if lock_info.is_live_at(now) {
                    UnlockOutcome::Released { lock_info }
                } else {
                    UnlockOutcome::NotLocked
                }
            }
        };
        drop(table);

        let label = match &outcome {
            UnlockOutcome::Released { .. } => {
                info!(canvas_id, object_id, session_id, "lock released");
                "released"
            }
            UnlockOutcome::Denied { .. } => "denied",
            UnlockOutcome::NotLocked => "not_locked",
        };
        self.telemetry.record_lock_operation("release", label);
        outcome
    }

    /// Current status of a key, removing the lock if it has expired
    pub fn get_lock_status(&self, canvas_id: &str, object_id: &str) -> LockStatus {
        self.check_lock(canvas_id, object_id).0
    }

    /// Status of a key plus the lock that was lazily expired by this check, if any
    pub fn check_lock(&self, canvas_id: &str, object_id: &str) -> (LockStatus, Option<LockInfo>) {
        let now = self.clock.now();
        {
            let table = self.read();
            match table.get(canvas_id).and_then(|c| c.get(object_id)) {
                None => return (LockStatus::unlocked(canvas_id, object_id), None),
                Some(info) if info.is_live_at(now) => return (LockStatus::locked(info, now), None),
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, the key may have changed in between
        let mut table = self.write();
        let current = table.get(canvas_id).and_then(|c| c.get(object_id)).cloned();
        match current {
            Some(info) if info.is_live_at(now) => (LockStatus::locked(&info, now), None),
            Some(info) => {
                if let Some(canvas) = table.get_mut(canvas_id) {
                    canvas.remove(object_id);
                }
                prune_canvas(&mut table, canvas_id);
                debug!(canvas_id, object_id, "lock expired on status check");
                self.telemetry.record_lock_operation("expire", "lazy");
                (LockStatus::unlocked(canvas_id, object_id), Some(info))
            }
            None => (LockStatus::unlocked(canvas_id, object_id), None),
        }
    }

    /// Remove every lock owned by `session_id`
    pub fn release_session_locks(&self, session_id: &str) -> ReleasedLocks {
        self.release_session_locks_where(session_id, |_| true)
    }

    /// Remove the locks `session_id` holds on the given canvases only
    pub fn release_session_locks_in(&self, session_id: &str, canvases: &BTreeSet<String>) -> ReleasedLocks {
        self.release_session_locks_where(session_id, |canvas| canvases.contains(canvas))
    }

    fn release_session_locks_where<F>(&self, session_id: &str, include: F) -> ReleasedLocks
    where
        F: Fn(&str) -> bool,
    {
        let mut table = self.write();
        let mut released = Vec::new();

        for (canvas_id, canvas) in table.iter_mut() {
            if !include(canvas_id) {
                continue;
            }
            canvas.retain(|_, info| {
                if info.session_id == session_id {
                    released.push(info.key());
                    false
                } else {
                    true
                }
            });
        }
        table.retain(|_, canvas| !canvas.is_empty());
        drop(table);

        released.sort();
        info!(session_id, count = released.len(), "released session locks");
        self.telemetry.record_lock_operation("release_session", "released");
        ReleasedLocks {
            session_id: session_id.to_string(),
            count: released.len(),
            released,
        }
    }

    /// Remove every expired lock and return what was removed
    pub fn sweep(&self) -> Vec<LockInfo> {
        self.sweep_where(|_| true)
    }

    /// Remove the expired locks of the given canvases
    pub fn sweep_canvases(&self, canvases: &BTreeSet<String>) -> Vec<LockInfo> {
        self.sweep_where(|canvas| canvases.contains(canvas))
    }

    fn sweep_where<F>(&self, include: F) -> Vec<LockInfo>
    where
        F: Fn(&str) -> bool,
    {
        let now = self.clock.now();
        let mut table = self.write();
        let mut expired = Vec::new();

        for (canvas_id, canvas) in table.iter_mut() {
            if !include(canvas_id) {
                continue;
            }
            canvas.retain(|_, info| {
                if info.is_live_at(now) {
                    true
                } else {
                    expired.push(info.clone());
                    false
                }
            });
        }
        table.retain(|_, canvas| !canvas.is_empty());
        drop(table);

        expired.sort_by(|a, b| a.key().cmp(&b.key()));
        if !expired.is_empty() {
            info!(expired = expired.len(), "lock sweep removed expired locks");
            for _ in &expired {
                self.telemetry.record_lock_operation("expire", "sweep");
            }
        }
        expired
    }

    /// Live locks, optionally restricted to one canvas
    ///
    /// The snapshot is copied under the table lock, and locks that are no longer live are
    /// left out even if no sweep has removed them yet.
    pub fn get_all_locks(&self, canvas_id: Option<&str>) -> LockSnapshot {
        let now = self.clock.now();
        let table = self.read();
        let mut snapshot = LockSnapshot::new();

        for (canvas, objects) in table.iter() {
            if canvas_id.map_or(false, |wanted| wanted != canvas) {
                continue;
            }
            let live: BTreeMap<String, LockInfo> = objects
                .iter()
                .filter(|(_, info)| info.is_live_at(now))
                .map(|(object, info)| (object.clone(), info.clone()))
                .collect();
            if !live.is_empty() {
                snapshot.insert(canvas.clone(), live);
            }
        }
        snapshot
    }

    /// Live locks held by a session
    pub fn locks_held_by(&self, session_id: &str) -> Vec<LockInfo> {
        let now = self.clock.now();
        let mut held: Vec<LockInfo> = self
            .read()
            .values()
            .flat_map(|objects| objects.values())
            .filter(|info| info.session_id == session_id && info.is_live_at(now))
            .cloned()
            .collect();
        held.sort_by(|a, b| a.key().cmp(&b.key()));
        held
    }

    /// Whether any lock record, live or not, exists on a canvas
    pub fn has_locks(&self, canvas_id: &str) -> bool {
        self.read().contains_key(canvas_id)
    }

    /// Canvases on which `session_id` holds any lock, live or not
    pub fn canvases_of_session(&self, session_id: &str) -> BTreeSet<String> {
        self.read()
            .iter()
            .filter(|(_, objects)| objects.values().any(|info| info.session_id == session_id))
            .map(|(canvas, _)| canvas.clone())
            .collect()
    }

    /// Canvases holding at least one expired lock
    pub fn canvases_with_expired_locks(&self) -> BTreeSet<String> {
        let now = self.clock.now();
        self.read()
            .iter()
            .filter(|(_, objects)| objects.values().any(|info| !info.is_live_at(now)))
            .map(|(canvas, _)| canvas.clone())
            .collect()
    }

    /// Set the timeout for locks acquired from now on; held locks keep theirs
    pub fn set_lock_timeout(&self, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(CanvasRuntimeError::Validation(
                "lock timeout must be at least one second".to_string(),
            ));
        }
        if seconds > MAX_LOCK_TIMEOUT_SECONDS {
            return Err(CanvasRuntimeError::Validation(format!(
                "lock timeout must not exceed {} seconds",
                MAX_LOCK_TIMEOUT_SECONDS
            )));
        }
        self.timeout_seconds.store(seconds, Ordering::SeqCst);
        info!(timeout_seconds = seconds, "lock timeout changed");
        Ok(())
    }

    pub fn get_lock_timeout(&self) -> u64 {
        self.timeout_seconds.load(Ordering::SeqCst)
    }
}

fn prune_canvas(table: &mut LockTable, canvas_id: &str) {
    if table.get(canvas_id).map_or(false, |c| c.is_empty()) {
        table.remove(canvas_id);
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout_seconds", &self.get_lock_timeout())
            .field("canvases", &self.read().len())
            .finish()
    }
}
