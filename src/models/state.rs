// Behavior states - the building blocks of element state machines
//
// ## State Machine Overview
//
// Every element (an air handler, a breaker panel, a pump) may own a state machine:
// an ordered list of behavior states plus a pointer to the current one.
//
//     [off] --start--> [running] --fault--> [alarm]
//       ^                  |                   |
//       +------stop--------+-------reset-------+
//
// A state lists the transitions that leave it. Each transition names its target state and
// may carry guard conditions that must all hold for the move to be allowed. Entering a state
// runs its entry actions; leaving it runs its exit actions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::action::Action;
use super::condition::{deserialize_conditions, Condition};

/// **State identifier** - names a behavior state within one element's state machine
///
/// ```rust
/// # use canvas_runtime::StateId;
/// let state = StateId::from("running");
/// assert_eq!(state.as_str(), "running");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub String);

impl StateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn new<S: Into<String>>(name: S) -> Self {
        StateId(name.into())
    }
}

impl From<&str> for StateId {
    fn from(s: &str) -> Self {
        StateId(s.to_string())
    }
}

impl From<String> for StateId {
    fn from(s: String) -> Self {
        StateId(s)
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a behavior state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Equipment,
    Process,
    System,
    Maintenance,
    Safety,
}

/// An outgoing transition of a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub target_state: StateId,

    /// Guard conditions; all must hold when the transition is checked against a context
    #[serde(default, deserialize_with = "deserialize_conditions")]
    pub conditions: Vec<Condition>,
}

impl StateTransition {
    pub fn to(target_state: &str) -> Self {
        Self {
            target_state: StateId::from(target_state),
            conditions: Vec::new(),
        }
    }

    pub fn guarded(target_state: &str, conditions: Vec<Condition>) -> Self {
        Self {
            target_state: StateId::from(target_state),
            conditions,
        }
    }
}

/// A state of an element state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorState {
    pub id: StateId,
    pub category: StateCategory,

    /// Property snapshot associated with the state
    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub transitions: Vec<StateTransition>,

    #[serde(default)]
    pub entry_actions: Vec<Action>,

    #[serde(default)]
    pub exit_actions: Vec<Action>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BehaviorState {
    pub fn new(id: &str, category: StateCategory) -> Self {
        Self {
            id: StateId::from(id),
            category,
            properties: Map::new(),
            transitions: Vec::new(),
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_transition(mut self, transition: StateTransition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_entry_action(mut self, action: Action) -> Self {
        self.entry_actions.push(action);
        self
    }

    pub fn with_exit_action(mut self, action: Action) -> Self {
        self.exit_actions.push(action);
        self
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    /// First transition of this state that leads to `target`
    pub fn transition_to(&self, target: &StateId) -> Option<&StateTransition> {
        self.transitions.iter().find(|t| &t.target_state == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_id_creation() {
        let state1 = StateId::from("off");
        let state2 = StateId::from("off".to_string());
        let state3 = StateId::new("off");

        assert_eq!(state1, state2);
        assert_eq!(state2, state3);
        assert_eq!(state1.to_string(), "off");
    }

    #[test]
    fn test_state_from_json() {
        let state: BehaviorState = serde_json::from_value(json!({
            "id": "running",
            "category": "equipment",
            "transitions": [{"target_state": "off"}]
        }))
        .unwrap();

        assert_eq!(state.id.as_str(), "running");
        assert!(state.transition_to(&StateId::from("off")).is_some());
        assert!(state.transition_to(&StateId::from("alarm")).is_none());
    }
}
