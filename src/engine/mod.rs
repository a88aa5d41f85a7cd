// Canvas Runtime Engine
// Evaluation, locking and delivery components

//! # Canvas Runtime Engine Module
//!
//! This module contains the components that evaluate element behavior and coordinate
//! collaborative editing. The engine is the layer between the domain models and the
//! transport that connects canvas clients.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: Pure data types (in `models/`)
//! - **Engine Layer**: Evaluation, state and coordination (this module)
//! - **Binaries**: Process wiring and offline tooling (in `bin/`)
//!
//! ## Engine Components
//!
//! ### Behavior Evaluation
//! - `conditions`: evaluates condition trees against an evaluation context
//! - `rules`: rule registry, snapshot evaluation ordered by priority
//! - `actions`: executes action lists, re-entering the dispatcher for `trigger` actions
//! - `states`: one state machine per element with guarded transitions
//! - `scheduler`: time triggers polled on a fixed cadence
//! - `events`: dispatcher with bounded history and isolated handlers
//!
//! ### Collaboration
//! - `locks`: per-object locks with expiry and session-scoped release
//! - `broadcast`: bounded push channels per client, indexed by canvas and user
//! - `canvas`: selection, navigation, edit history and annotations per canvas
//! - `collaboration`: the façade a transport talks to
//!
//! ### Plumbing
//! - `clock`: injectable time source
//! - `telemetry`: counters and timings
//! - `runtime`: assembles everything and owns the background loops
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API

/// Action execution
///
/// Contains:
/// - ActionExecutor and per-action outcomes
/// - Simulator and EventSink collaborator traits
pub mod actions;

/// Push channels for connected clients
pub mod broadcast;

/// Per-canvas UI state
pub mod canvas;

/// Time sources
pub mod clock;

/// Collaboration façade over locks, canvas state and broadcasts
pub mod collaboration;

/// Condition evaluation
///
/// Contains:
/// - EvaluationContext, the variable map conditions read from
/// - ConditionEvaluator for every condition variant
pub mod conditions;

/// Event dispatch with bounded history
pub mod events;

/// Object locks with expiry
pub mod locks;

/// Rules engine
///
/// Contains:
/// - RuleEngine for registering and evaluating behavior rules
/// - Named condition registry
pub mod rules;

/// Runtime assembly and background task lifecycle
pub mod runtime;

/// Time trigger scheduler
pub mod scheduler;

/// Element state machines
pub mod states;

/// Runtime counters and timings
pub mod telemetry;


// Re-export main engine types for clean API access
pub use actions::{ActionExecutor, ActionOutcome, ActionScope, ActionStatus, EventSink, Simulator};
pub use broadcast::{BroadcastRegistry, ClientId, ClientInfo, ClientRegistration, DeliveryReport};
pub use canvas::{Annotation, CanvasStateStore, EditRecord, NavigationState, SelectionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaboration::CollaborationService;
pub use conditions::{ConditionEvaluator, EvaluationContext};
pub use events::{DispatchReport, EventDispatcher, EventHandler};
pub use locks::{LockManager, LockSnapshot};
pub use rules::RuleEngine;
pub use runtime::CanvasRuntime;
pub use scheduler::{TimeTriggerScheduler, TriggerFire};
pub use states::{StateMachineManager, TransitionOutcome};
pub use telemetry::{InMemoryTelemetry, Telemetry, TracingTelemetry};
