// Lock records and lock operation outcomes

//! # Lock Models
//!
//! A lock is keyed by `(canvas_id, object_id)` and owned by exactly one editing session.
//! Every lock operation returns one of the typed outcomes below; a conflict or a denied unlock
//! is a normal answer, not an error.
//!
//! A lock is **live** while `now < acquired_at + timeout_seconds`. At
//! `acquired_at + timeout_seconds` it has expired.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::CanvasRuntimeError;

/// Longest lock timeout accepted: one year
pub const MAX_LOCK_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Ownership record of a locked canvas object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub canvas_id: String,
    pub object_id: String,
    pub session_id: String,
    pub user_id: String,
    pub acquired_at: DateTime<Utc>,

    /// Timeout in effect when the lock was acquired
    pub timeout_seconds: u64,

    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(
        canvas_id: &str,
        object_id: &str,
        session_id: &str,
        user_id: &str,
        acquired_at: DateTime<Utc>,
        timeout_seconds: u64,
    ) -> Self {
        // Saturates at the latest representable instant instead of overflowing
        let expires_at = i64::try_from(timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| acquired_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            canvas_id: canvas_id.to_string(),
            object_id: object_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            acquired_at,
            timeout_seconds,
            expires_at,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Seconds left before expiry, never negative
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> f64 {
        let remaining = (self.expires_at - now).num_milliseconds().max(0);
        remaining as f64 / 1000.0
    }

    pub fn key(&self) -> LockKey {
        LockKey {
            canvas_id: self.canvas_id.clone(),
            object_id: self.object_id.clone(),
        }
    }
}

/// Composite key of a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub canvas_id: String,
    pub object_id: String,
}

/// Result of a lock attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockOutcome {
    /// The caller's session now holds the lock (or already did)
    Acquired { lock_info: LockInfo },

    /// Another session holds a live lock
    Conflict { lock_info: LockInfo },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired { .. })
    }

    pub fn lock_info(&self) -> &LockInfo {
        match self {
            LockOutcome::Acquired { lock_info } | LockOutcome::Conflict { lock_info } => lock_info,
        }
    }

    /// The acquired lock, or a conflict error naming the holding session
    pub fn into_result(self) -> crate::Result<LockInfo> {
        match self {
            LockOutcome::Acquired { lock_info } => Ok(lock_info),
            LockOutcome::Conflict { lock_info } => Err(CanvasRuntimeError::Conflict {
                canvas_id: lock_info.canvas_id,
                object_id: lock_info.object_id,
                holder_session: lock_info.session_id,
            }),
        }
    }
}

/// Result of an unlock attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnlockOutcome {
    Released { lock_info: LockInfo },

    /// The live lock belongs to another session
    Denied { lock_info: LockInfo },

    NotLocked,
}

/// Result of a lock status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatus {
    pub canvas_id: String,
    pub object_id: String,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Seconds until expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<f64>,
}

impl LockStatus {
    pub fn unlocked(canvas_id: &str, object_id: &str) -> Self {
        Self {
            canvas_id: canvas_id.to_string(),
            object_id: object_id.to_string(),
            locked: false,
            session_id: None,
            user_id: None,
            remaining_time: None,
        }
    }

    pub fn locked(info: &LockInfo, now: DateTime<Utc>) -> Self {
        Self {
            canvas_id: info.canvas_id.clone(),
            object_id: info.object_id.clone(),
            locked: true,
            session_id: Some(info.session_id.clone()),
            user_id: Some(info.user_id.clone()),
            remaining_time: Some(info.remaining_seconds(now)),
        }
    }
}

/// Locks removed by a session-scoped release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedLocks {
    pub session_id: String,
    pub count: usize,
    pub released: Vec<LockKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_liveness_boundary() {
        let t0 = Utc::now();
        let info = LockInfo::new("c", "o", "s", "u", t0, 10);

        assert!(info.is_live_at(t0));
        assert!(info.is_live_at(t0 + Duration::milliseconds(9_999)));
        assert!(!info.is_live_at(t0 + Duration::seconds(10)));
        assert_eq!(info.remaining_seconds(t0 + Duration::seconds(4)), 6.0);
        assert_eq!(info.remaining_seconds(t0 + Duration::seconds(40)), 0.0);
    }

    #[test]
    fn test_outcome_wire_shape() {
        let info = LockInfo::new("c", "o", "s", "u", Utc::now(), 10);
        let value = serde_json::to_value(LockOutcome::Conflict { lock_info: info }).unwrap();
        assert_eq!(value["status"], json!("conflict"));
        assert_eq!(value["lock_info"]["session_id"], json!("s"));

        let value = serde_json::to_value(UnlockOutcome::NotLocked).unwrap();
        assert_eq!(value, json!({"status": "not_locked"}));
    }

    #[test]
    fn test_huge_timeout_saturates_expiry() {
        let now = Utc::now();
        let info = LockInfo::new("c", "o", "s", "u", now, 10_000_000_000_000);
        assert_eq!(info.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(info.is_live_at(now));

        let info = LockInfo::new("c", "o", "s", "u", now, u64::MAX);
        assert_eq!(info.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(info.remaining_seconds(now) > 0.0);
    }

    #[test]
    fn test_conflict_as_error() {
        let info = LockInfo::new("c", "o", "holder", "u", Utc::now(), 10);
        assert!(LockOutcome::Acquired { lock_info: info.clone() }.into_result().is_ok());

        let err = LockOutcome::Conflict { lock_info: info }.into_result().unwrap_err();
        assert!(matches!(
            err,
            CanvasRuntimeError::Conflict { ref holder_session, .. } if holder_session == "holder"
        ));
        assert!(err.to_string().contains("locked by session holder"));
    }
}
