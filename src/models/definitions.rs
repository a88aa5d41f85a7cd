// Behavior definition documents

//! # Definitions
//!
//! A definitions document bundles the rules, time triggers and state machines of a canvas
//! deployment in one JSON file. The server installs it at startup and the admin CLI
//! validates or evaluates it offline.
//!
//! ```json
//! {
//!   "rules": [ { "id": "overheat", "type": "safety", "conditions": [], "actions": [] } ],
//!   "triggers": [ { "id": "hourly", "schedule_type": "cyclic",
//!                   "schedule_data": { "interval_seconds": 3600 }, "actions": [] } ],
//!   "state_machines": [ { "element_id": "pump-1", "initial_state": "off", "states": [] } ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{BehaviorRule, BehaviorState, TimeTrigger};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub element_id: String,
    pub initial_state: String,
    pub states: Vec<BehaviorState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub rules: Vec<BehaviorRule>,
    #[serde(default)]
    pub triggers: Vec<TimeTrigger>,
    #[serde(default)]
    pub state_machines: Vec<StateMachineDefinition>,
}

impl Definitions {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Problems that would make installation fail or silently shadow entries
    ///
    /// Empty list means the document is installable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                problems.push("rule with empty id".to_string());
            } else if !rule_ids.insert(rule.id.as_str()) {
                problems.push(format!("rule {} is defined twice", rule.id));
            }
        }

        let mut trigger_ids = HashSet::new();
        for trigger in &self.triggers {
            if !trigger_ids.insert(trigger.id.as_str()) {
                problems.push(format!("trigger {} is defined twice", trigger.id));
            }
            if let Err(reason) = trigger.schedule.validate() {
                problems.push(format!("trigger {}: {}", trigger.id, reason));
            }
        }

        let mut elements = HashSet::new();
        for machine in &self.state_machines {
            if !elements.insert(machine.element_id.as_str()) {
                problems.push(format!("state machine for {} is defined twice", machine.element_id));
            }
            if !machine.states.iter().any(|s| s.id.as_str() == machine.initial_state) {
                problems.push(format!(
                    "state machine for {}: initial state {} is not defined",
                    machine.element_id, machine.initial_state
                ));
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_validate() {
        let definitions = Definitions::from_json(
            r#"{
                "rules": [
                    {"id": "r1", "type": "safety", "conditions": [], "actions": []},
                    {"id": "r1", "type": "business", "conditions": [], "actions": []}
                ],
                "triggers": [
                    {"id": "t1", "schedule_type": "cyclic", "schedule_data": {"interval_seconds": 0}, "actions": []}
                ],
                "state_machines": [
                    {"element_id": "pump-1", "initial_state": "on", "states": [{"id": "off", "category": "equipment"}]}
                ]
            }"#,
        )
        .unwrap();

        let problems = definitions.problems();
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems[0].contains("r1"));
        assert!(problems[2].contains("initial state on"));
    }

    #[test]
    fn test_empty_document_is_valid() {
        let definitions = Definitions::from_json("{}").unwrap();
        assert!(definitions.problems().is_empty());
    }
}
