// Event dispatcher for element events

//! # Event System
//!
//! Every element event goes through [`EventDispatcher::dispatch`]:
//!
//! 1. The event is appended to a bounded history and published to subscribers.
//! 2. An evaluation context is built from the event (`element_id`, `event_type`,
//!    `event_data`, `timestamp`, plus the top-level fields of `event_data`).
//! 3. Matching rules are evaluated and their actions executed in priority order.
//! 4. The handler for the event type runs: a registered custom handler if there is one,
//!    otherwise the built-in logging handler for the standard event kinds. Custom event types
//!    without a handler are logged as unhandled.
//!
//! Handler failures are caught and reported in the [`DispatchReport`]; they never reach the
//! caller as an error and never affect other event types.
//!
//! ## Derived Events
//! `trigger` actions re-enter the dispatcher through the [`EventSink`] implementation below.
//! Each re-entry is one level deeper, and the action executor refuses to go past its
//! configured maximum depth, so a rule that triggers itself terminates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::actions::{ActionExecutor, ActionOutcome, ActionScope, EventSink};
use crate::engine::clock::Clock;
use crate::engine::conditions::EvaluationContext;
use crate::engine::rules::RuleEngine;
use crate::engine::telemetry::Telemetry;
use crate::models::{EventKind, EventRecord};
use crate::Result;

/// Handler invoked for every event of one type
pub type EventHandler = Arc<dyn Fn(&EventRecord) -> Result<()> + Send + Sync>;

/// What happened while dispatching one event
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub element_id: String,
    pub event_type: String,
    pub depth: usize,
    pub matched_rules: Vec<String>,
    pub action_outcomes: Vec<ActionOutcome>,

    /// False when no handler exists for the event type
    pub handled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_error: Option<String>,
}

/// Routes element events to rules, handlers and subscribers
pub struct EventDispatcher {
    rules: Arc<RuleEngine>,
    executor: Arc<ActionExecutor>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    history: Mutex<VecDeque<EventRecord>>,
    history_capacity: usize,
    sender: broadcast::Sender<EventRecord>,
}

impl EventDispatcher {
    pub fn new(
        rules: Arc<RuleEngine>,
        executor: Arc<ActionExecutor>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn Telemetry>,
        history_capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(history_capacity.max(1));
        Self {
            rules,
            executor,
            clock,
            telemetry,
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_capacity: history_capacity.max(1),
            sender,
        }
    }

    /// Register the handler for an event type, replacing any previous one
    pub fn register_handler<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&EventRecord) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_string(), Arc::new(handler));
        debug!(event_type, "registered event handler");
    }

    pub fn unregister_handler(&self, event_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_type)
            .is_some()
    }

    /// Subscribe to every event recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Dispatch an event originating outside the runtime
    pub fn dispatch(&self, element_id: &str, event_type: &str, event_data: Value) -> DispatchReport {
        self.dispatch_at_depth(element_id, event_type, event_data, 0)
    }

    fn dispatch_at_depth(
        &self,
        element_id: &str,
        event_type: &str,
        event_data: Value,
        depth: usize,
    ) -> DispatchReport {
        let started = Instant::now();
        let record = EventRecord {
            element_id: element_id.to_string(),
            event_type: EventKind::parse(event_type),
            event_data,
            timestamp: self.clock.now(),
        };
        self.remember(&record);

        let mut context = event_context(&record);
        let matches = self.rules.evaluate_rules(element_id, &context);
        let scope = ActionScope::at_depth(element_id, depth);

        let mut action_outcomes = Vec::new();
        for rule in &matches {
            debug!(element_id, event_type, rule_id = %rule.rule_id, priority = rule.priority, "rule matched");
            action_outcomes.extend(
                self.executor
                    .execute(&rule.actions, &scope, &mut context, Some(self)),
            );
        }

        let (handled, handler_error) = self.run_handler(&record);
        self.telemetry.record_event(event_type, handled);
        self.telemetry.record_timing("dispatch", started.elapsed());

        DispatchReport {
            element_id: element_id.to_string(),
            event_type: event_type.to_string(),
            depth,
            matched_rules: matches.into_iter().map(|m| m.rule_id).collect(),
            action_outcomes,
            handled,
            handler_error,
        }
    }

    fn remember(&self, record: &EventRecord) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(record.clone());
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }
        // no subscribers is fine
        let _ = self.sender.send(record.clone());
    }

    fn run_handler(&self, record: &EventRecord) -> (bool, Option<String>) {
        let event_type = record.event_type.as_str();
        let custom = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned();

        match custom {
            Some(handler) => match handler(record) {
                Ok(()) => (true, None),
                Err(e) => {
                    error!(element_id = %record.element_id, event_type, error = %e, "event handler failed");
                    (true, Some(e.to_string()))
                }
            },
            None if record.event_type.is_builtin() => {
                info!(
                    element_id = %record.element_id,
                    event_type,
                    data = %record.event_data,
                    "event received"
                );
                (true, None)
            }
            None => {
                warn!(element_id = %record.element_id, event_type, "no handler for event type");
                (false, None)
            }
        }
    }

    /// Recorded events, oldest first
    pub fn history(&self) -> Vec<EventRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Recorded events for one element, oldest first
    pub fn history_for(&self, element_id: &str) -> Vec<EventRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.element_id == element_id)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl EventSink for EventDispatcher {
    fn emit(&self, element_id: &str, event_type: &str, event_data: Value, depth: usize) {
        self.dispatch_at_depth(element_id, event_type, event_data, depth);
    }
}

/// Context for rule evaluation; fields of an object payload are lifted to the top level
fn event_context(record: &EventRecord) -> EvaluationContext {
    let mut context = EvaluationContext::new(record.timestamp)
        .with("element_id", json!(record.element_id))
        .with("event_type", json!(record.event_type.as_str()))
        .with("event_data", record.event_data.clone())
        .with("timestamp", json!(record.timestamp.to_rfc3339()));

    if let Some(fields) = record.event_data.as_object() {
        for (key, value) in fields {
            context.set(key, value.clone());
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::engine::telemetry::InMemoryTelemetry;
    use crate::models::{Action, BehaviorRule, ComparisonOperator, Condition, RuleType};
    use crate::CanvasRuntimeError;

    struct Fixture {
        dispatcher: EventDispatcher,
        rules: Arc<RuleEngine>,
        telemetry: Arc<InMemoryTelemetry>,
    }

    fn fixture(max_depth: usize, history_capacity: usize) -> Fixture {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let rules = Arc::new(RuleEngine::new());
        let executor = Arc::new(ActionExecutor::new(telemetry.clone(), max_depth));
        let dispatcher = EventDispatcher::new(
            rules.clone(),
            executor,
            Arc::new(ManualClock::starting_now()),
            telemetry.clone(),
            history_capacity,
        );
        Fixture {
            dispatcher,
            rules,
            telemetry,
        }
    }

    #[test]
    fn test_rules_run_against_event_fields() {
        let f = fixture(4, 100);
        f.rules
            .register_rule(
                BehaviorRule::new("overheat", RuleType::Safety)
                    .with_condition(Condition::threshold(
                        "temperature",
                        ComparisonOperator::GreaterThan,
                        80.0,
                    ))
                    .with_action(Action::update("alarm", json!(true))),
            )
            .unwrap();

        let cold = f.dispatcher.dispatch("boiler-1", "physics_event", json!({"temperature": 20}));
        assert!(cold.matched_rules.is_empty());
        assert!(cold.handled);

        let hot = f.dispatcher.dispatch("boiler-1", "physics_event", json!({"temperature": 95}));
        assert_eq!(hot.matched_rules, vec!["overheat".to_string()]);
        assert_eq!(hot.action_outcomes.len(), 1);
        assert!(hot.action_outcomes[0].is_applied());
        assert_eq!(f.telemetry.counter("event.physics_event.handled"), 2);
    }

    #[test]
    fn test_self_triggering_rule_stops_at_depth_limit() {
        let f = fixture(3, 100);
        f.rules
            .register_rule(
                BehaviorRule::new("echo", RuleType::Operational)
                    .with_action(Action::trigger(None, "ping", json!({}))),
            )
            .unwrap();
        f.dispatcher.register_handler("ping", |_| Ok(()));

        let report = f.dispatcher.dispatch("relay-1", "ping", json!({}));
        assert!(report.action_outcomes[0].is_applied());

        // depths 0, 1, 2 and 3; the trigger at depth 3 is refused
        assert_eq!(f.dispatcher.history_len(), 4);
        assert_eq!(f.telemetry.counter("action.trigger.failed"), 1);
    }

    #[test]
    fn test_handler_failure_is_isolated() {
        let f = fixture(4, 100);
        f.dispatcher.register_handler("door_opened", |_| {
            Err(CanvasRuntimeError::Internal("sensor offline".to_string()))
        });

        let failed = f.dispatcher.dispatch("door-3", "door_opened", json!({}));
        assert!(failed.handled);
        assert!(failed.handler_error.unwrap().contains("sensor offline"));

        let other = f.dispatcher.dispatch("door-3", "system_event", json!({}));
        assert!(other.handled);
        assert!(other.handler_error.is_none());
    }

    #[test]
    fn test_unknown_event_type_is_unhandled() {
        let f = fixture(4, 100);
        let report = f.dispatcher.dispatch("x", "mystery", json!(null));
        assert!(!report.handled);
        assert_eq!(f.telemetry.counter("event.mystery.unhandled"), 1);

        f.dispatcher.register_handler("mystery", |_| Ok(()));
        assert!(f.dispatcher.dispatch("x", "mystery", json!(null)).handled);
        assert!(f.dispatcher.unregister_handler("mystery"));
    }

    #[test]
    fn test_history_is_bounded() {
        let f = fixture(4, 3);
        for i in 0..5 {
            f.dispatcher.dispatch(&format!("e{}", i), "system_event", json!({}));
        }
        let history = f.dispatcher.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].element_id, "e2");
        assert_eq!(f.dispatcher.history_for("e4").len(), 1);

        f.dispatcher.clear_history();
        assert_eq!(f.dispatcher.history_len(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let f = fixture(4, 10);
        let mut events = f.dispatcher.subscribe();
        f.dispatcher.dispatch("valve-2", "operational_event", json!({"open": true}));

        let record = events.recv().await.unwrap();
        assert_eq!(record.element_id, "valve-2");
        assert_eq!(record.event_type, EventKind::OperationalEvent);
    }
}
