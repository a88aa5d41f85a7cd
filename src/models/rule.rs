// Behavior rules for element evaluation

//! # Behavior Rule Module
//!
//! A behavior rule pairs an ordered list of conditions with an ordered list of actions.
//! When every condition holds for an element, the rule "matches" and its actions are
//! handed back to the caller, ordered by rule priority.
//!
//! ## Key Concepts
//!
//! - **BehaviorRule**: id, type, conditions, actions, priority, enabled flag, metadata
//! - **RuleType**: business, safety, operational, maintenance, compliance
//! - **RuleMatch**: one entry of an evaluation result
//!
//! ## Element Scoping
//!
//! Rules apply to every element unless their metadata narrows them down:
//! - `target_elements`: an element id or a list of element ids
//! - `element_types`: a list of element types, compared with the context's `element_type`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::action::Action;
use super::condition::{deserialize_conditions, Condition};

/// Category of a behavior rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Business,
    Safety,
    Operational,
    Maintenance,
    Compliance,
}

/// A behavior rule with conditions and actions
///
/// ## Example:
/// ```
/// use canvas_runtime::models::{Action, BehaviorRule, ComparisonOperator, Condition, RuleType};
///
/// let rule = BehaviorRule::new("overheat", RuleType::Safety)
///     .with_condition(Condition::threshold("temperature", ComparisonOperator::GreaterThan, 30.0))
///     .with_action(Action::log("{element_id} is overheating"))
///     .with_priority(10);
/// assert!(rule.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRule {
    /// Unique identifier; registering the same id again replaces the rule
    pub id: String,

    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// All conditions must hold (AND semantics)
    #[serde(default, deserialize_with = "deserialize_conditions")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub actions: Vec<Action>,

    /// Higher priorities are returned first
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form metadata; `target_elements` and `element_types` restrict the rule
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_priority() -> i32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl BehaviorRule {
    /// Create an enabled rule with priority 1 and no conditions or actions
    pub fn new(id: &str, rule_type: RuleType) -> Self {
        Self {
            id: id.to_string(),
            rule_type,
            conditions: Vec::new(),
            actions: Vec::new(),
            priority: default_priority(),
            enabled: true,
            metadata: Map::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict the rule to the given element ids
    pub fn for_elements(mut self, element_ids: &[&str]) -> Self {
        self.metadata.insert(
            "target_elements".to_string(),
            Value::Array(element_ids.iter().map(|id| Value::from(*id)).collect()),
        );
        self
    }

    /// Restrict the rule to the given element types
    pub fn for_element_types(mut self, element_types: &[&str]) -> Self {
        self.metadata.insert(
            "element_types".to_string(),
            Value::Array(element_types.iter().map(|t| Value::from(*t)).collect()),
        );
        self
    }

    /// Check the metadata scoping against an element id and its type
    ///
    /// `target_elements` wins over `element_types` when both are present. Metadata values
    /// of an unexpected shape leave the rule unscoped.
    pub fn applies_to(&self, element_id: &str, element_type: Option<&str>) -> bool {
        match self.metadata.get("target_elements") {
            Some(Value::String(target)) => return target == element_id,
            Some(Value::Array(targets)) => {
                return targets.iter().any(|t| t.as_str() == Some(element_id));
            }
            _ => {}
        }

        if let Some(Value::Array(types)) = self.metadata.get("element_types") {
            return match element_type {
                Some(element_type) => types.iter().any(|t| t.as_str() == Some(element_type)),
                None => false,
            };
        }

        true
    }
}

/// One matching rule returned by rule evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub actions: Vec<Action>,
    pub priority: i32,
}

impl From<&BehaviorRule> for RuleMatch {
    fn from(rule: &BehaviorRule) -> Self {
        RuleMatch {
            rule_id: rule.id.clone(),
            rule_type: rule.rule_type,
            actions: rule.actions.clone(),
            priority: rule.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_defaults_from_json() {
        let rule: BehaviorRule = serde_json::from_value(json!({
            "id": "r1",
            "type": "compliance"
        }))
        .unwrap();

        assert_eq!(rule.priority, 1);
        assert!(rule.enabled);
        assert!(rule.conditions.is_empty());
        assert_eq!(rule.rule_type, RuleType::Compliance);
    }

    #[test]
    fn test_untagged_rule_condition_is_simple() {
        let rule: BehaviorRule = serde_json::from_value(json!({
            "id": "r1",
            "type": "operational",
            "conditions": [
                {"variable": "status", "operator": "==", "value": "running"},
                {"type": "threshold", "variable": "load", "operator": ">", "threshold": 0.9}
            ]
        }))
        .unwrap();

        assert!(matches!(rule.conditions[0], Condition::Simple { .. }));
        assert!(matches!(rule.conditions[1], Condition::Threshold { .. }));
    }

    #[test]
    fn test_target_elements_scoping() {
        let rule = BehaviorRule::new("r1", RuleType::Business).for_elements(&["pump-1", "pump-2"]);
        assert!(rule.applies_to("pump-1", None));
        assert!(!rule.applies_to("pump-3", Some("pump")));

        let mut single = BehaviorRule::new("r2", RuleType::Business);
        single.metadata.insert("target_elements".to_string(), json!("valve-9"));
        assert!(single.applies_to("valve-9", None));
        assert!(!single.applies_to("valve-1", None));
    }

    #[test]
    fn test_element_type_scoping() {
        let rule = BehaviorRule::new("r1", RuleType::Safety).for_element_types(&["breaker", "panel"]);
        assert!(rule.applies_to("anything", Some("panel")));
        assert!(!rule.applies_to("anything", Some("duct")));
        assert!(!rule.applies_to("anything", None));
    }

    #[test]
    fn test_unscoped_rule_applies_everywhere() {
        let rule = BehaviorRule::new("r1", RuleType::Operational);
        assert!(rule.applies_to("x", None));
    }
}
