// Canvas Runtime - Rust Edition
// Behavior evaluation and collaborative locking for building-system canvases

//! # Canvas Runtime Library
//!
//! This is the main library crate for the canvas runtime, the in-memory coordination layer
//! behind real-time collaborative editing of building-system canvases (electrical, mechanical,
//! plumbing, ...). This file serves as the **library root** and defines the public API.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`BehaviorRule`]: Conditions plus actions, ordered by priority
//! - [`Condition`]: Threshold, time, spatial, relational, complex and simple checks
//! - [`BehaviorState`]: A state of an element's state machine with guarded transitions
//! - [`TimeTrigger`]: Scheduled, cyclic, sequential, delayed and duration triggers
//! - [`LockInfo`]: Ownership record of a locked canvas object
//! - [`UiEvent`]: Selection, editing, navigation and annotation events from clients
//!
//! ### Engine
//!
//! #### [`RuleEngine`] - Rule Evaluation
//!
//! Evaluates every enabled rule that applies to an element and returns the matches sorted by
//! priority (highest first, registration order on ties). Evaluation works on a snapshot of
//! the rule table, so concurrent registration never shows up mid-evaluation.
//!
//! #### [`LockManager`] - Collaborative Locking
//!
//! Grants at most one live lock per `(canvas_id, object_id)`. Locks expire after the
//! timeout that was configured when they were acquired; expired locks are removed lazily on
//! status checks and proactively by a background sweep.
//!
//! #### [`CollaborationService`] - The Façade Used By Transports
//!
//! Ties locks, UI events, per-canvas state and the broadcast registry together, so that every
//! visible change is pushed to the clients of the canvas in the order it happened.
//!
//! **Usage Example:**
//! ```rust
//! use canvas_runtime::{CanvasRuntime, RuntimeConfig};
//!
//! let runtime = CanvasRuntime::new(RuntimeConfig::default());
//! let outcome = runtime.collaboration().lock("canvas-1", "ahu-3", "session-a", "alice");
//! assert!(outcome.is_acquired());
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Synchronous Core, Async Edges
//! All engine operations are plain synchronous methods guarded by fine-grained locks.
//! Only the long-running loops (trigger scheduler, lock sweep) and the per-client delivery
//! channels are async, which keeps the core easy to test and safe to call from any task.
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use canvas_runtime::engine::locks::LockManager`,
//! users can write `use canvas_runtime::LockManager`.

// Core domain models (pure data, serde friendly)
pub mod models;

// Engine implementations (rules, states, scheduler, locks, dispatch, broadcast)
pub mod engine;

// Runtime configuration
pub mod config;

// Re-export core domain types for easy access
pub use models::{
    Action,                // Tagged action descriptor
    AnnotationPayload,     // Annotation event payload
    BehaviorRule,          // Rule with conditions and actions
    BehaviorState,         // State of an element state machine
    Condition,             // Tagged condition descriptor
    EditingPayload,        // Editing event payload
    EventKind,             // Closed set of dispatchable event kinds
    EventRecord,           // Entry of the bounded event history
    LockInfo,              // Lock ownership record
    LockOutcome,           // Result of a lock attempt
    LockStatus,            // Result of a lock status query
    NavigationPayload,     // Navigation event payload
    PushMessage,           // Outbound message for canvas clients
    RuleMatch,             // One entry of an evaluate_rules result
    RuleType,              // Business, safety, ...
    Schedule,              // Trigger schedule
    SelectionPayload,      // Selection event payload
    StateCategory,         // Equipment, process, ...
    StateId,               // State identifier
    TimeTrigger,           // Time based trigger
    UiEvent,               // Typed UI event envelope
    UiPayload,             // Selection / editing / navigation / annotation
    UnlockOutcome,         // Result of an unlock attempt
};

// Re-export engine types for convenience
pub use engine::{
    actions::{ActionExecutor, ActionOutcome, Simulator},
    broadcast::BroadcastRegistry,
    canvas::CanvasStateStore,
    clock::{Clock, ManualClock, SystemClock},
    collaboration::CollaborationService,
    conditions::{ConditionEvaluator, EvaluationContext},
    events::EventDispatcher,
    locks::LockManager,
    rules::RuleEngine,
    runtime::CanvasRuntime,
    scheduler::TimeTriggerScheduler,
    states::StateMachineManager,
    telemetry::{InMemoryTelemetry, Telemetry, TracingTelemetry},
};

pub use config::RuntimeConfig;

// Core error types
use thiserror::Error;

/// Custom error types for canvas runtime operations
///
/// Expected outcomes such as a lock conflict or an unknown lock are modelled as typed
/// result values ([`LockOutcome`], [`UnlockOutcome`]) rather than errors. This enum covers
/// malformed input, lookups that callers asked to fail, and internal failures of action
/// handlers or collaborators.
#[derive(Error, Debug)]
pub enum CanvasRuntimeError {
    /// Malformed condition, action, rule, trigger or request input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Object is locked by another session
    #[error("Object {object_id} on canvas {canvas_id} is locked by session {holder_session}")]
    Conflict {
        canvas_id: String,
        object_id: String,
        holder_session: String,
    },

    /// Unknown rule, trigger, state machine, state or lock
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Unexpected failure inside an action handler or collaborator
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl From<std::io::Error> for CanvasRuntimeError {
    fn from(err: std::io::Error) -> Self {
        CanvasRuntimeError::Internal(err.to_string())
    }
}

impl CanvasRuntimeError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CanvasRuntimeError::NotFound { kind, id: id.into() }
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, CanvasRuntimeError>;
