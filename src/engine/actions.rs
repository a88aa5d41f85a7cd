// Action execution for rules, state entry/exit and time triggers

//! # Action Executor
//!
//! Interprets [`Action`] descriptors. Every action in a list runs on its own: a failing
//! action produces a failed [`ActionOutcome`] and the next action still runs.
//!
//! ## Collaborators
//!
//! - [`Simulator`]: external physics/infrastructure simulation. Physics actions fail without
//!   one; infrastructure actions fall back to logging the requested operation.
//! - [`EventSink`]: where `trigger` actions send derived events. The event dispatcher
//!   implements it, which makes trigger actions re-entrant; [`ActionScope::depth`] bounds
//!   how deep that re-entry may go.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! `Arc<dyn Simulator>` and `&dyn EventSink` let the executor call code it knows nothing
//! about. The `Send + Sync` supertraits make those objects shareable across tokio tasks.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::conditions::EvaluationContext;
use crate::engine::telemetry::Telemetry;
use crate::models::{Action, ArithmeticOperation, LogLevel, Operand};
use crate::{CanvasRuntimeError, Result};

/// External simulation collaborator for `physics` and `infrastructure` actions
pub trait Simulator: Send + Sync {
    /// Run the simulation `kind` for `element_id` and return its result
    fn simulate(&self, kind: &str, element_id: &str, data: &Value) -> Result<Value>;
}

/// Receiver of events derived by `trigger` actions
pub trait EventSink: Send + Sync {
    /// Dispatch an event at the given re-entry depth
    fn emit(&self, element_id: &str, event_type: &str, event_data: Value, depth: usize);
}

/// Element an action list runs against, and how deeply trigger actions have nested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionScope {
    pub element_id: String,
    pub depth: usize,
}

impl ActionScope {
    pub fn new(element_id: &str) -> Self {
        Self {
            element_id: element_id.to_string(),
            depth: 0,
        }
    }

    pub fn at_depth(element_id: &str, depth: usize) -> Self {
        Self {
            element_id: element_id.to_string(),
            depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    Failed,
    /// Unknown action kinds are skipped
    Skipped,
}

/// Result of one executed action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub kind: &'static str,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn is_applied(&self) -> bool {
        self.status == ActionStatus::Applied
    }
}

/// Executes action descriptors
pub struct ActionExecutor {
    simulator: Option<Arc<dyn Simulator>>,
    telemetry: Arc<dyn Telemetry>,
    max_trigger_depth: usize,
}

impl ActionExecutor {
    pub fn new(telemetry: Arc<dyn Telemetry>, max_trigger_depth: usize) -> Self {
        Self {
            simulator: None,
            telemetry,
            max_trigger_depth,
        }
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn max_trigger_depth(&self) -> usize {
        self.max_trigger_depth
    }

    /// Run `actions` in order against `context`
    ///
    /// Updates and calculations write into `context`, so later actions in the same list see
    /// their results.
    pub fn execute(
        &self,
        actions: &[Action],
        scope: &ActionScope,
        context: &mut EvaluationContext,
        sink: Option<&dyn EventSink>,
    ) -> Vec<ActionOutcome> {
        actions
            .iter()
            .map(|action| self.execute_one(action, scope, context, sink))
            .collect()
    }

    fn execute_one(
        &self,
        action: &Action,
        scope: &ActionScope,
        context: &mut EvaluationContext,
        sink: Option<&dyn EventSink>,
    ) -> ActionOutcome {
        let kind = action.kind();

        if let Action::Unknown = action {
            warn!(element_id = %scope.element_id, "skipping unknown action type");
            self.telemetry.record_action(kind, false);
            return ActionOutcome {
                kind,
                status: ActionStatus::Skipped,
                result: Value::Null,
                message: Some("unknown action type".to_string()),
            };
        }

        let result = match action {
            Action::Update {
                target_property,
                value,
            } => self.update(scope, context, target_property, value),
            Action::Animate {
                animation_type,
                duration,
                properties,
            } => {
                if !duration.is_finite() || *duration < 0.0 {
                    Err(CanvasRuntimeError::Validation(format!(
                        "animation duration must be non-negative, got {}",
                        duration
                    )))
                } else {
                    info!(element_id = %scope.element_id, animation_type = %animation_type, duration, "animating element");
                    Ok(json!({
                        "animation_type": animation_type,
                        "duration": duration,
                        "properties": properties,
                    }))
                }
            }
            Action::Calculate {
                target_variable,
                operation,
                operands,
            } => calculate(*operation, operands, context).map(|value| {
                context.set(target_variable, json!(value));
                debug!(element_id = %scope.element_id, target_variable = %target_variable, value, "calculated");
                json!({ "target_variable": target_variable, "value": value })
            }),
            Action::Trigger {
                target_element,
                event_type,
                event_data,
            } => self.trigger(scope, sink, target_element.as_deref(), event_type, event_data),
            Action::Log { message, level } => {
                let line = render_template(message, &scope.element_id, context);
                emit_log(*level, &scope.element_id, &line);
                Ok(json!({ "message": line }))
            }
            Action::CadParity {
                cad_action_type,
                parameters,
            } => {
                info!(element_id = %scope.element_id, cad_action_type = ?cad_action_type, "CAD-parity action");
                Ok(json!({ "cad_action_type": cad_action_type, "parameters": parameters }))
            }
            Action::Infrastructure {
                system_type,
                operation,
                parameters,
            } => {
                let operation = operation
                    .as_deref()
                    .unwrap_or_else(|| system_type.default_operation());
                match &self.simulator {
                    Some(simulator) => simulator.simulate(
                        system_type.as_str(),
                        &scope.element_id,
                        &json!({ "operation": operation, "parameters": parameters }),
                    ),
                    None => {
                        info!(
                            element_id = %scope.element_id,
                            system = system_type.as_str(),
                            operation,
                            "infrastructure operation recorded without simulator"
                        );
                        Ok(json!({
                            "system_type": system_type.as_str(),
                            "operation": operation,
                            "simulated": false,
                        }))
                    }
                }
            }
            Action::Physics { simulation, data } => match &self.simulator {
                Some(simulator) => simulator.simulate(simulation, &scope.element_id, data),
                None => Err(CanvasRuntimeError::Internal(
                    "no physics simulator attached".to_string(),
                )),
            },
            Action::Unknown => Ok(Value::Null),
        };

        match result {
            Ok(result) => {
                self.telemetry.record_action(kind, true);
                ActionOutcome {
                    kind,
                    status: ActionStatus::Applied,
                    result,
                    message: None,
                }
            }
            Err(e) => {
                error!(element_id = %scope.element_id, kind, error = %e, "action failed");
                self.telemetry.record_action(kind, false);
                ActionOutcome {
                    kind,
                    status: ActionStatus::Failed,
                    result: Value::Null,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    fn update(
        &self,
        scope: &ActionScope,
        context: &mut EvaluationContext,
        target_property: &str,
        value: &Value,
    ) -> Result<Value> {
        if target_property.is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "update action needs a target_property".to_string(),
            ));
        }
        context.set(target_property, value.clone());
        info!(element_id = %scope.element_id, property = target_property, value = %value, "property update requested");
        Ok(json!({ "target_property": target_property, "value": value }))
    }

    fn trigger(
        &self,
        scope: &ActionScope,
        sink: Option<&dyn EventSink>,
        target_element: Option<&str>,
        event_type: &str,
        event_data: &Value,
    ) -> Result<Value> {
        let target = target_element.unwrap_or(&scope.element_id);
        if scope.depth >= self.max_trigger_depth {
            return Err(CanvasRuntimeError::Internal(format!(
                "trigger depth limit {} reached for event {} on {}",
                self.max_trigger_depth, event_type, target
            )));
        }
        let sink = sink.ok_or_else(|| {
            CanvasRuntimeError::Internal("no event sink available for trigger action".to_string())
        })?;
        sink.emit(target, event_type, event_data.clone(), scope.depth + 1);
        Ok(json!({ "target_element": target, "event_type": event_type }))
    }
}

fn calculate(
    operation: ArithmeticOperation,
    operands: &[Operand],
    context: &EvaluationContext,
) -> Result<f64> {
    let values = operands
        .iter()
        .map(|operand| match operand {
            Operand::Literal(value) => Ok(*value),
            Operand::Variable(name) => context.number(name).ok_or_else(|| {
                CanvasRuntimeError::Validation(format!("operand `{}` is missing or not numeric", name))
            }),
        })
        .collect::<Result<Vec<f64>>>()?;

    let (first, rest) = values.split_first().ok_or_else(|| {
        CanvasRuntimeError::Validation("calculate action needs at least one operand".to_string())
    })?;

    let value = match operation {
        ArithmeticOperation::Add => values.iter().sum(),
        ArithmeticOperation::Sub => rest.iter().fold(*first, |acc, v| acc - v),
        ArithmeticOperation::Mul => values.iter().product(),
        ArithmeticOperation::Div => {
            if rest.iter().any(|v| *v == 0.0) {
                return Err(CanvasRuntimeError::Validation("division by zero".to_string()));
            }
            rest.iter().fold(*first, |acc, v| acc / v)
        }
        ArithmeticOperation::Min => rest.iter().fold(*first, |acc, v| acc.min(*v)),
        ArithmeticOperation::Max => rest.iter().fold(*first, |acc, v| acc.max(*v)),
        ArithmeticOperation::Avg => values.iter().sum::<f64>() / values.len() as f64,
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(CanvasRuntimeError::Validation(format!(
            "calculation produced a non-finite result ({})",
            value
        )))
    }
}

/// Replace `{name}` placeholders with context values; unknown names are left as written
fn render_template(template: &str, element_id: &str, context: &EvaluationContext) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let name = &after_open[..close];
                match lookup(name, element_id, context) {
                    Some(value) => rendered.push_str(&value),
                    None => {
                        rendered.push('{');
                        rendered.push_str(name);
                        rendered.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                rendered.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

fn lookup(name: &str, element_id: &str, context: &EvaluationContext) -> Option<String> {
    match context.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None if name == "element_id" => Some(element_id.to_string()),
        None => None,
    }
}

fn emit_log(level: LogLevel, element_id: &str, line: &str) {
    match level {
        LogLevel::Debug => debug!(element_id, "{}", line),
        LogLevel::Info => info!(element_id, "{}", line),
        LogLevel::Warning => warn!(element_id, "{}", line),
        LogLevel::Error => error!(element_id, "{}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::telemetry::InMemoryTelemetry;
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(String, String, usize)>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, element_id: &str, event_type: &str, _event_data: Value, depth: usize) {
            self.events
                .lock()
                .unwrap()
                .push((element_id.to_string(), event_type.to_string(), depth));
        }
    }

    struct EchoSimulator;

    impl Simulator for EchoSimulator {
        fn simulate(&self, kind: &str, element_id: &str, data: &Value) -> Result<Value> {
            if kind == "explode" {
                return Err(CanvasRuntimeError::Internal("solver diverged".to_string()));
            }
            Ok(json!({ "kind": kind, "element_id": element_id, "data": data }))
        }
    }

    fn executor() -> (ActionExecutor, Arc<InMemoryTelemetry>) {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        (ActionExecutor::new(telemetry.clone(), 2), telemetry)
    }

    fn actions(value: Value) -> Vec<Action> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_failures_do_not_stop_siblings() {
        let (executor, telemetry) = executor();
        let mut context = EvaluationContext::new(Utc::now()).with("current", json!(10));
        let list = actions(json!([
            {"type": "calculate", "target_variable": "x", "operation": "div", "operands": [1, 0]},
            {"type": "teleport"},
            {"type": "calculate", "target_variable": "power", "operation": "mul", "operands": ["current", 230]},
            {"type": "update", "target_property": "status", "value": "overloaded"}
        ]));

        let outcomes = executor.execute(&list, &ActionScope::new("panel-1"), &mut context, None);

        let statuses: Vec<ActionStatus> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![ActionStatus::Failed, ActionStatus::Skipped, ActionStatus::Applied, ActionStatus::Applied]
        );
        assert_eq!(context.number("power"), Some(2300.0));
        assert_eq!(context.str("status"), Some("overloaded"));
        assert_eq!(telemetry.counter("action.calculate.failed"), 1);
    }

    #[test]
    fn test_calculate_operations() {
        let context = EvaluationContext::new(Utc::now()).with("a", json!(4)).with("b", json!(8));
        let ops = [Operand::Variable("a".into()), Operand::Variable("b".into()), Operand::Literal(3.0)];

        assert_eq!(calculate(ArithmeticOperation::Add, &ops, &context).unwrap(), 15.0);
        assert_eq!(calculate(ArithmeticOperation::Sub, &ops, &context).unwrap(), -7.0);
        assert_eq!(calculate(ArithmeticOperation::Min, &ops, &context).unwrap(), 3.0);
        assert_eq!(calculate(ArithmeticOperation::Max, &ops, &context).unwrap(), 8.0);
        assert_eq!(calculate(ArithmeticOperation::Avg, &ops, &context).unwrap(), 5.0);
        assert!(calculate(ArithmeticOperation::Add, &[], &context).is_err());
        assert!(calculate(ArithmeticOperation::Add, &[Operand::Variable("zz".into())], &context).is_err());
    }

    #[test]
    fn test_trigger_depth_is_bounded() {
        let (executor, _) = executor();
        let sink = RecordingSink { events: Mutex::new(Vec::new()) };
        let mut context = EvaluationContext::new(Utc::now());
        let list = vec![Action::trigger(None, "cascade", Value::Null)];

        let ok = executor.execute(&list, &ActionScope::at_depth("valve-1", 1), &mut context, Some(&sink));
        assert!(ok[0].is_applied());

        let blocked = executor.execute(&list, &ActionScope::at_depth("valve-1", 2), &mut context, Some(&sink));
        assert_eq!(blocked[0].status, ActionStatus::Failed);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.as_slice(), &[("valve-1".to_string(), "cascade".to_string(), 2)]);
    }

    #[test]
    fn test_simulator_collaborator() {
        let (executor, _) = executor();
        let mut context = EvaluationContext::new(Utc::now());
        let list = actions(json!([
            {"type": "physics", "simulation": "thermal", "data": {"load": 3}},
            {"type": "infrastructure", "system_type": "electrical"}
        ]));

        let without = executor.execute(&list, &ActionScope::new("e1"), &mut context, None);
        assert_eq!(without[0].status, ActionStatus::Failed);
        assert!(without[1].is_applied());
        assert_eq!(without[1].result["operation"], json!("power_control"));

        let executor = executor.with_simulator(Arc::new(EchoSimulator));
        let with = executor.execute(&list, &ActionScope::new("e1"), &mut context, None);
        assert!(with[0].is_applied());
        assert_eq!(with[0].result["kind"], json!("thermal"));
        assert_eq!(with[1].result["kind"], json!("electrical"));

        let failing = vec![Action::Physics { simulation: "explode".into(), data: Value::Null }];
        let failed = executor.execute(&failing, &ActionScope::new("e1"), &mut context, None);
        assert_eq!(failed[0].message.as_deref(), Some("Internal error: solver diverged"));
    }

    #[test]
    fn test_log_template_rendering() {
        let context = EvaluationContext::new(Utc::now()).with("temperature", json!(35)).with("zone", json!("east"));
        assert_eq!(
            render_template("{element_id} in {zone} at {temperature} ({missing})", "ahu-3", &context),
            "ahu-3 in east at 35 ({missing})"
        );
        assert_eq!(render_template("unbalanced {brace", "x", &context), "unbalanced {brace");
    }
}
