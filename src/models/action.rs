// Action descriptors executed by the action executor

//! # Action Module
//!
//! Actions describe side effects: property updates, animations, calculations, derived
//! events, log lines, CAD-parity operations, infrastructure operations and physics
//! simulations. They are data only; [`ActionExecutor`](crate::engine::actions::ActionExecutor)
//! decides how each kind is carried out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single action descriptor, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Record the intent to set `target_property` to `value`
    ///
    /// The value is also written into the evaluation context so later actions in the same
    /// list observe it. Applying it to the element store is the store's job.
    Update {
        target_property: String,
        value: Value,
    },

    /// Start an animation on the element
    Animate {
        #[serde(default = "default_animation_type")]
        animation_type: String,
        #[serde(default = "default_animation_duration")]
        duration: f64,
        #[serde(default)]
        properties: Map<String, Value>,
    },

    /// Compute `operation(operands)` and store the result in `target_variable`
    Calculate {
        target_variable: String,
        operation: ArithmeticOperation,
        operands: Vec<Operand>,
    },

    /// Dispatch a derived event, by default on the same element
    Trigger {
        #[serde(default)]
        target_element: Option<String>,
        #[serde(default = "default_trigger_event")]
        event_type: String,
        #[serde(default)]
        event_data: Value,
    },

    /// Emit a log line; `{variable}` placeholders are filled from the context
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },

    /// Dimensioning, constraint, snap, selection or editing behavior
    CadParity {
        #[serde(default)]
        cad_action_type: CadActionKind,
        #[serde(default)]
        parameters: Map<String, Value>,
    },

    /// Building-system operation (hvac, electrical, plumbing, ...)
    Infrastructure {
        #[serde(default)]
        system_type: InfrastructureSystem,
        #[serde(default)]
        operation: Option<String>,
        #[serde(default)]
        parameters: Map<String, Value>,
    },

    /// Run a physics simulation through the attached simulator
    Physics {
        simulation: String,
        #[serde(default)]
        data: Value,
    },

    /// Any action kind this runtime does not understand
    #[serde(other)]
    Unknown,
}

fn default_animation_type() -> String {
    "motion".to_string()
}

fn default_animation_duration() -> f64 {
    1.0
}

fn default_trigger_event() -> String {
    "custom".to_string()
}

impl Action {
    /// Short name of the action kind, used in logs and outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Update { .. } => "update",
            Action::Animate { .. } => "animate",
            Action::Calculate { .. } => "calculate",
            Action::Trigger { .. } => "trigger",
            Action::Log { .. } => "log",
            Action::CadParity { .. } => "cad_parity",
            Action::Infrastructure { .. } => "infrastructure",
            Action::Physics { .. } => "physics",
            Action::Unknown => "unknown",
        }
    }

    pub fn update(target_property: &str, value: Value) -> Self {
        Action::Update {
            target_property: target_property.to_string(),
            value,
        }
    }

    pub fn log(message: &str) -> Self {
        Action::Log {
            message: message.to_string(),
            level: LogLevel::Info,
        }
    }

    pub fn trigger(target_element: Option<&str>, event_type: &str, event_data: Value) -> Self {
        Action::Trigger {
            target_element: target_element.map(str::to_string),
            event_type: event_type.to_string(),
            event_data,
        }
    }
}

/// Arithmetic supported by calculate actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOperation {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Avg,
}

/// A literal number or the name of a numeric context variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Literal(f64),
    Variable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadActionKind {
    #[default]
    Dimension,
    Constraint,
    Snap,
    Selection,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfrastructureSystem {
    #[default]
    Hvac,
    Electrical,
    Plumbing,
    FireProtection,
    Security,
}

impl InfrastructureSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfrastructureSystem::Hvac => "hvac",
            InfrastructureSystem::Electrical => "electrical",
            InfrastructureSystem::Plumbing => "plumbing",
            InfrastructureSystem::FireProtection => "fire_protection",
            InfrastructureSystem::Security => "security",
        }
    }

    /// Operation assumed when the action does not name one
    pub fn default_operation(&self) -> &'static str {
        match self {
            InfrastructureSystem::Hvac => "temperature_control",
            InfrastructureSystem::Electrical => "power_control",
            InfrastructureSystem::Plumbing => "flow_control",
            InfrastructureSystem::FireProtection => "safety_check",
            InfrastructureSystem::Security => "access_control",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_in() {
        let action: Action = serde_json::from_value(json!({"type": "animate"})).unwrap();
        assert_eq!(
            action,
            Action::Animate {
                animation_type: "motion".to_string(),
                duration: 1.0,
                properties: Map::new(),
            }
        );

        let action: Action =
            serde_json::from_value(json!({"type": "infrastructure", "system_type": "fire_protection"}))
                .unwrap();
        match action {
            Action::Infrastructure { system_type, operation, .. } => {
                assert_eq!(system_type, InfrastructureSystem::FireProtection);
                assert_eq!(operation, None);
                assert_eq!(system_type.default_operation(), "safety_check");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_operands_accept_numbers_and_names() {
        let action: Action = serde_json::from_value(json!({
            "type": "calculate",
            "target_variable": "load",
            "operation": "mul",
            "operands": ["current", 230]
        }))
        .unwrap();

        match action {
            Action::Calculate { operands, .. } => {
                assert_eq!(operands[0], Operand::Variable("current".to_string()));
                assert_eq!(operands[1], Operand::Literal(230.0));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_kind() {
        let action: Action = serde_json::from_value(json!({"type": "teleport"})).unwrap();
        assert_eq!(action.kind(), "unknown");
    }
}
