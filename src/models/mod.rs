// Core domain models for the canvas runtime
// These are plain data structures, free of locking and I/O

//! # Domain Models Module
//!
//! This module contains the data the engine works on: rules, conditions, actions, states,
//! triggers, locks and events. Everything here is `serde` friendly so rule files, trigger
//! files and client messages map straight onto these types.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization
//! This `mod.rs` file serves as the **module root** for the `models` directory.
//! Each `pub mod` declaration pulls in the `.rs` file of the same name.
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so users can write
//! `use canvas_runtime::models::BehaviorRule` instead of
//! `use canvas_runtime::models::rule::BehaviorRule`.

// Threshold, time, spatial, relational, complex and simple conditions
pub mod condition;

// Update, animate, calculate, trigger, log, cad_parity, infrastructure and physics actions
pub mod action;

// BehaviorRule and RuleMatch
pub mod rule;

// BehaviorState, StateTransition and StateId for element state machines
pub mod state;

// TimeTrigger and its Schedule
pub mod trigger;

// LockInfo and lock operation outcomes
pub mod lock;

// Element events, UI events and push messages
pub mod event;

// Rule, trigger and state machine bundles loaded from JSON
pub mod definitions;

/// Re-export condition types
pub use condition::{
    Bounds, ComparisonOperator, Condition, LogicOperator, MembershipOperator, Point,
    RelationalCondition, SpatialCondition, TimeCondition,
};

/// Re-export action types
pub use action::{
    Action, ArithmeticOperation, CadActionKind, InfrastructureSystem, LogLevel, Operand,
};

/// Re-export rule types
pub use rule::{BehaviorRule, RuleMatch, RuleType};

/// Re-export state machine types
pub use state::{BehaviorState, StateCategory, StateId, StateTransition};

/// Re-export trigger types
pub use trigger::{Schedule, TimeTrigger};

/// Re-export lock types
pub use lock::{LockInfo, LockKey, LockOutcome, LockStatus, ReleasedLocks, UnlockOutcome};

/// Re-export event types
pub use event::{
    AnnotationPayload, EditingPayload, EventKind, EventRecord, NavigationPayload, PushMessage,
    SelectionPayload, UiEvent, UiPayload,
};

/// Re-export definition documents
pub use definitions::{Definitions, StateMachineDefinition};
