// State machine manager for per-element behavior states

//! # State Machine Manager
//!
//! Owns one state machine per element: the element's ordered [`BehaviorState`] list and a
//! pointer to its current state. The pointer only moves through
//! [`StateMachineManager::execute_transition`].
//!
//! ## Transition Rules
//!
//! 1. The *target* state must exist in the element's state list.
//! 2. When a context is supplied, the current state must list a transition to the target and
//!    all guard conditions of that transition must hold. Without a context the move is
//!    allowed unconditionally (system-initiated transitions).
//! 3. The pointer moves atomically. Afterwards the exit actions of the state that was left
//!    run, followed by the entry actions of the new state.
//!
//! Actions run after the element's map entry is released, so an action that dispatches an
//! event which transitions the same element again cannot deadlock.
//!
//! ## Rust Learning Notes:
//!
//! ### DashMap for Per-Element State
//! `DashMap` shards its entries across several internal locks. Transitions on different
//! elements rarely contend, and there is no single global lock around the whole table.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::actions::{ActionExecutor, ActionOutcome, ActionScope, EventSink};
use crate::engine::clock::Clock;
use crate::engine::conditions::{ConditionEvaluator, EvaluationContext};
use crate::models::{BehaviorState, StateId};
use crate::{CanvasRuntimeError, Result};

#[derive(Debug, Clone)]
struct StateMachine {
    states: Vec<BehaviorState>,
    current: StateId,
}

impl StateMachine {
    fn state(&self, id: &StateId) -> Option<&BehaviorState> {
        self.states.iter().find(|s| &s.id == id)
    }
}

/// Result of a transition request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Completed {
        element_id: String,
        from: StateId,
        to: StateId,
        actions: Vec<ActionOutcome>,
    },
    UnknownElement {
        element_id: String,
    },
    UnknownState {
        element_id: String,
        target: StateId,
    },
    /// The current state does not allow the move, or a guard condition failed
    Rejected {
        element_id: String,
        from: StateId,
        to: StateId,
        reason: String,
    },
}

impl TransitionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransitionOutcome::Completed { .. })
    }
}

/// Registry of element state machines
pub struct StateMachineManager {
    machines: DashMap<String, StateMachine>,
    evaluator: ConditionEvaluator,
    executor: Arc<ActionExecutor>,
    clock: Arc<dyn Clock>,
}

impl StateMachineManager {
    pub fn new(executor: Arc<ActionExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            machines: DashMap::new(),
            evaluator: ConditionEvaluator::new(),
            executor,
            clock,
        }
    }

    /// Register (or replace) the state machine of an element
    ///
    /// Fails with a validation error when the state list is empty, contains duplicate
    /// state ids, or does not contain `initial_state`.
    pub fn register_state_machine(
        &self,
        element_id: &str,
        states: Vec<BehaviorState>,
        initial_state: &str,
    ) -> Result<()> {
        if states.is_empty() {
            return Err(CanvasRuntimeError::Validation(format!(
                "state machine for {} has no states",
                element_id
            )));
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = states.iter().find(|s| !seen.insert(s.id.clone())) {
            return Err(CanvasRuntimeError::Validation(format!(
                "state machine for {} declares state {} twice",
                element_id, duplicate.id
            )));
        }

        let initial = StateId::from(initial_state);
        if !states.iter().any(|s| s.id == initial) {
            return Err(CanvasRuntimeError::Validation(format!(
                "initial state {} is not one of the states of {}",
                initial, element_id
            )));
        }

        info!(element_id, initial_state, states = states.len(), "registered state machine");
        self.machines.insert(
            element_id.to_string(),
            StateMachine {
                states,
                current: initial,
            },
        );
        Ok(())
    }

    pub fn unregister_state_machine(&self, element_id: &str) -> bool {
        self.machines.remove(element_id).is_some()
    }

    /// Current state of an element, if it has a state machine
    pub fn get_element_state(&self, element_id: &str) -> Option<StateId> {
        self.machines.get(element_id).map(|m| m.current.clone())
    }

    /// States registered for an element
    pub fn get_states(&self, element_id: &str) -> Option<Vec<BehaviorState>> {
        self.machines.get(element_id).map(|m| m.states.clone())
    }

    /// Element ids with a registered state machine, sorted
    pub fn get_registered_state_machines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.machines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Move `element_id` to `target_state`
    ///
    /// Guard conditions are checked only when `context` is supplied. Derived events from
    /// `trigger` actions go to `sink`.
    pub fn execute_transition(
        &self,
        element_id: &str,
        target_state: &str,
        context: Option<&EvaluationContext>,
        sink: Option<&dyn EventSink>,
    ) -> TransitionOutcome {
        let target = StateId::from(target_state);

        let (from, exit_actions, entry_actions) = {
            let mut machine = match self.machines.get_mut(element_id) {
                Some(machine) => machine,
                None => {
                    warn!(element_id, target_state, "transition for element without state machine");
                    return TransitionOutcome::UnknownElement {
                        element_id: element_id.to_string(),
                    };
                }
            };

            let entry_actions = match machine.state(&target) {
                Some(state) => state.entry_actions.clone(),
                None => {
                    warn!(element_id, target_state, "transition to unknown state");
                    return TransitionOutcome::UnknownState {
                        element_id: element_id.to_string(),
                        target,
                    };
                }
            };

            let from = machine.current.clone();
            let current = machine.state(&from);

            if let Some(context) = context {
                let transition = current.and_then(|state| state.transition_to(&target));
                let reason = match transition {
                    None => Some(format!("{} has no transition to {}", from, target)),
                    Some(t) if !self.evaluator.evaluate_all(&t.conditions, context) => {
                        Some("guard conditions not met".to_string())
                    }
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    debug!(element_id, from = %from, to = %target, reason = %reason, "transition rejected");
                    return TransitionOutcome::Rejected {
                        element_id: element_id.to_string(),
                        from,
                        to: target,
                        reason,
                    };
                }
            }

            let exit_actions = current.map(|s| s.exit_actions.clone()).unwrap_or_default();
            machine.current = target.clone();
            (from, exit_actions, entry_actions)
        };

        info!(element_id, from = %from, to = %target, "state transition");

        let mut action_context = match context {
            Some(context) => context.clone(),
            None => EvaluationContext::new(self.clock.now()),
        };
        action_context.set("element_id", json!(element_id));
        action_context.set("from_state", json!(from.as_str()));
        action_context.set("to_state", json!(target.as_str()));

        let scope = ActionScope::new(element_id);
        let mut actions = self.executor.execute(&exit_actions, &scope, &mut action_context, sink);
        actions.extend(self.executor.execute(&entry_actions, &scope, &mut action_context, sink));

        TransitionOutcome::Completed {
            element_id: element_id.to_string(),
            from,
            to: target,
            actions,
        }
    }
}
