// Events: dispatched element events, UI events from clients, outbound push messages

//! # Event Models
//!
//! Three families of event data flow through the runtime:
//!
//! - **Element events** ([`EventKind`] + [`EventRecord`]): dispatched against an element,
//!   evaluated against the rule table and kept in a bounded history.
//! - **UI events** ([`UiEvent`]): selection, editing, navigation and annotation events sent
//!   by canvas clients. The payload shape depends on `event_type`.
//! - **Push messages** ([`PushMessage`]): `{status, event_type, feedback}` objects delivered to
//!   every client of a canvas.
//!
//! ## Rust Learning Notes:
//!
//! ### Adjacently Tagged Payloads
//! `#[serde(tag = "event_type", content = "payload")]` keeps the discriminator next to the
//! payload instead of inside it, so `{"event_type": "selection", "payload": {...}}` maps onto
//! `UiPayload::Selection(SelectionPayload)`. `#[serde(flatten)]` then folds the pair into
//! the surrounding envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a dispatched element event
///
/// The built-in kinds have default handlers; anything else is carried as `Custom` and only
/// handled if a handler was registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    UserInteraction,
    SystemEvent,
    PhysicsEvent,
    EnvironmentalEvent,
    OperationalEvent,
    CadParity,
    Infrastructure,
    Custom(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "user_interaction" => EventKind::UserInteraction,
            "system_event" => EventKind::SystemEvent,
            "physics_event" => EventKind::PhysicsEvent,
            "environmental_event" => EventKind::EnvironmentalEvent,
            "operational_event" => EventKind::OperationalEvent,
            "cad_parity" => EventKind::CadParity,
            "infrastructure" => EventKind::Infrastructure,
            other => EventKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::UserInteraction => "user_interaction",
            EventKind::SystemEvent => "system_event",
            EventKind::PhysicsEvent => "physics_event",
            EventKind::EnvironmentalEvent => "environmental_event",
            EventKind::OperationalEvent => "operational_event",
            EventKind::CadParity => "cad_parity",
            EventKind::Infrastructure => "infrastructure",
            EventKind::Custom(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, EventKind::Custom(_))
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        EventKind::parse(name)
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        EventKind::parse(&name)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry of the bounded event history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub element_id: String,
    pub event_type: EventKind,
    pub event_data: Value,
    pub timestamp: DateTime<Utc>,
}

/// A UI event sent by a canvas client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiEvent {
    #[serde(flatten)]
    pub payload: UiPayload,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    pub session_id: String,
    pub user_id: String,
    pub canvas_id: String,
}

impl UiEvent {
    pub fn new(canvas_id: &str, session_id: &str, user_id: &str, payload: UiPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            canvas_id: canvas_id.to_string(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Typed payload of a UI event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum UiPayload {
    Selection(SelectionPayload),
    Editing(EditingPayload),
    Navigation(NavigationPayload),
    Annotation(AnnotationPayload),
}

impl UiPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            UiPayload::Selection(_) => "selection",
            UiPayload::Editing(_) => "editing",
            UiPayload::Navigation(_) => "navigation",
            UiPayload::Annotation(_) => "annotation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionPayload {
    #[serde(default = "default_selection_mode")]
    pub selection_mode: String,
    #[serde(default)]
    pub selected_ids: Vec<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub modifiers: Map<String, Value>,
}

fn default_selection_mode() -> String {
    "single".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EditingPayload {
    pub target_id: String,
    #[serde(default = "default_edit_type")]
    pub edit_type: String,
    #[serde(default)]
    pub before: Value,
    #[serde(default)]
    pub after: Value,
}

fn default_edit_type() -> String {
    "modify".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NavigationPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnnotationPayload {
    pub target_id: String,
    #[serde(default = "default_annotation_type")]
    pub annotation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_annotation_type() -> String {
    "note".to_string()
}

/// Outbound message delivered to every client of a canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub status: String,
    pub event_type: String,
    pub feedback: Value,
}

impl PushMessage {
    pub fn new(status: &str, event_type: &str, feedback: Value) -> Self {
        Self {
            status: status.to_string(),
            event_type: event_type.to_string(),
            feedback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_strings() {
        assert_eq!(EventKind::parse("physics_event"), EventKind::PhysicsEvent);
        assert_eq!(
            EventKind::parse("valve_opened"),
            EventKind::Custom("valve_opened".to_string())
        );
        assert_eq!(serde_json::to_value(EventKind::CadParity).unwrap(), json!("cad_parity"));
        assert!(!EventKind::parse("valve_opened").is_builtin());
    }

    #[test]
    fn test_ui_event_envelope() {
        let event: UiEvent = serde_json::from_value(json!({
            "event_type": "editing",
            "session_id": "s1",
            "user_id": "u1",
            "canvas_id": "c1",
            "payload": {"target_id": "duct-4", "after": {"width": 12}}
        }))
        .unwrap();

        assert_eq!(event.event_type(), "editing");
        match event.payload {
            UiPayload::Editing(edit) => {
                assert_eq!(edit.target_id, "duct-4");
                assert_eq!(edit.edit_type, "modify");
                assert_eq!(edit.before, Value::Null);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_ui_event_type_is_rejected() {
        let result: Result<UiEvent, _> = serde_json::from_value(json!({
            "event_type": "teleport",
            "session_id": "s1",
            "user_id": "u1",
            "canvas_id": "c1",
            "payload": {}
        }));
        assert!(result.is_err());
    }
}
