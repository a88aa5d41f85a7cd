// Per-canvas UI state: selection, navigation, edit history and annotations

//! # Canvas State Store
//!
//! Collaborative UI events mutate a small amount of shared state per canvas. This store owns
//! it; the collaboration service decides *whether* an event may be applied (lock checks) and
//! the store applies it.
//!
//! Edits go onto an undo stack bounded by the history limit. Undo moves the newest edit to the
//! redo stack, redo moves it back, and any new edit clears the redo stack.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::models::{AnnotationPayload, EditingPayload, NavigationPayload, SelectionPayload};
use crate::{CanvasRuntimeError, Result};

/// Edit types a canvas accepts
pub const EDIT_TYPES: &[&str] = &[
    "create", "modify", "move", "resize", "rotate", "delete", "property", "style",
];

/// Default number of edits kept per canvas
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub selected_ids: Vec<String>,
    pub selection_mode: String,
    pub origin: Option<String>,
    pub session_id: String,
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationState {
    pub camera: Option<Value>,
    pub zoom: Option<f64>,
    pub target: Option<Value>,
    pub last_action: Option<String>,
    pub user_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One applied edit, as kept in the undo and redo stacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub target_id: String,
    pub edit_type: String,
    pub before: Value,
    pub after: Value,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_type: String,
    pub content: Option<String>,
    pub location: Option<Value>,
    pub media: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Annotation {
    /// Apply the known fields of a JSON object onto this annotation
    fn apply_changes(&mut self, changes: &Value, now: DateTime<Utc>) -> Result<()> {
        let changes = changes.as_object().ok_or_else(|| {
            CanvasRuntimeError::Validation("annotation changes must be a JSON object".to_string())
        })?;

        for (key, value) in changes {
            match key.as_str() {
                "annotation_type" => {
                    self.annotation_type = value
                        .as_str()
                        .ok_or_else(|| invalid_field("annotation_type"))?
                        .to_string()
                }
                "content" => self.content = value.as_str().map(str::to_string),
                "location" => self.location = Some(value.clone()).filter(|v| !v.is_null()),
                "media" => self.media = Some(value.clone()).filter(|v| !v.is_null()),
                "tags" => {
                    self.tags = serde_json::from_value(value.clone())
                        .map_err(|_| invalid_field("tags"))?
                }
                other => debug!(field = other, "ignoring unknown annotation field"),
            }
        }
        self.updated_at = Some(now);
        Ok(())
    }
}

fn invalid_field(field: &str) -> CanvasRuntimeError {
    CanvasRuntimeError::Validation(format!("annotation field {} has the wrong type", field))
}

#[derive(Debug, Default)]
struct CanvasState {
    selection: Option<SelectionState>,
    navigation: NavigationState,
    annotations: BTreeMap<String, Vec<Annotation>>,
    undo: VecDeque<EditRecord>,
    redo: Vec<EditRecord>,
}

/// UI state of every canvas, keyed by canvas id
#[derive(Debug)]
pub struct CanvasStateStore {
    canvases: DashMap<String, CanvasState>,
    history_limit: usize,
}

impl CanvasStateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            canvases: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn apply_selection(
        &self,
        canvas_id: &str,
        session_id: &str,
        user_id: &str,
        payload: &SelectionPayload,
        now: DateTime<Utc>,
    ) -> SelectionState {
        let selection = SelectionState {
            selected_ids: payload.selected_ids.clone(),
            selection_mode: payload.selection_mode.clone(),
            origin: payload.origin.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            updated_at: now,
        };
        self.canvases
            .entry(canvas_id.to_string())
            .or_default()
            .selection = Some(selection.clone());
        selection
    }

    /// Record an edit; unknown edit types and empty targets are rejected
    pub fn apply_edit(
        &self,
        canvas_id: &str,
        session_id: &str,
        user_id: &str,
        payload: &EditingPayload,
        now: DateTime<Utc>,
    ) -> Result<EditRecord> {
        if payload.target_id.is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "edit has no target_id".to_string(),
            ));
        }
        if !EDIT_TYPES.contains(&payload.edit_type.as_str()) {
            return Err(CanvasRuntimeError::Validation(format!(
                "unsupported edit type: {}",
                payload.edit_type
            )));
        }

        let record = EditRecord {
            target_id: payload.target_id.clone(),
            edit_type: payload.edit_type.clone(),
            before: payload.before.clone(),
            after: payload.after.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: now,
        };

        let mut canvas = self.canvases.entry(canvas_id.to_string()).or_default();
        canvas.undo.push_back(record.clone());
        while canvas.undo.len() > self.history_limit {
            canvas.undo.pop_front();
        }
        canvas.redo.clear();
        Ok(record)
    }

    pub fn apply_navigation(
        &self,
        canvas_id: &str,
        user_id: &str,
        payload: &NavigationPayload,
        now: DateTime<Utc>,
    ) -> NavigationState {
        let mut canvas = self.canvases.entry(canvas_id.to_string()).or_default();
        let navigation = &mut canvas.navigation;
        if let Some(camera) = &payload.camera {
            navigation.camera = Some(camera.clone());
        }
        if let Some(zoom) = payload.zoom {
            navigation.zoom = Some(zoom);
        }
        if let Some(target) = &payload.target {
            navigation.target = Some(target.clone());
        }
        navigation.last_action = Some(payload.action.clone());
        navigation.user_id = Some(user_id.to_string());
        navigation.updated_at = Some(now);
        navigation.clone()
    }

    /// Append an annotation to a target and return its index
    pub fn add_annotation(
        &self,
        canvas_id: &str,
        user_id: &str,
        payload: &AnnotationPayload,
        now: DateTime<Utc>,
    ) -> Result<(usize, Annotation)> {
        if payload.target_id.is_empty() {
            return Err(CanvasRuntimeError::Validation(
                "annotation has no target_id".to_string(),
            ));
        }
        let annotation = Annotation {
            annotation_type: payload.annotation_type.clone(),
            content: payload.content.clone(),
            location: payload.location.clone(),
            media: payload.media.clone(),
            tags: payload.tags.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: None,
        };

        let mut canvas = self.canvases.entry(canvas_id.to_string()).or_default();
        let list = canvas
            .annotations
            .entry(payload.target_id.clone())
            .or_default();
        list.push(annotation.clone());
        Ok((list.len() - 1, annotation))
    }

    pub fn update_annotation(
        &self,
        canvas_id: &str,
        target_id: &str,
        index: usize,
        changes: &Value,
        now: DateTime<Utc>,
    ) -> Result<Annotation> {
        let mut canvas = self
            .canvases
            .get_mut(canvas_id)
            .ok_or_else(|| CanvasRuntimeError::not_found("canvas", canvas_id))?;
        let annotation = canvas
            .annotations
            .get_mut(target_id)
            .and_then(|list| list.get_mut(index))
            .ok_or_else(|| CanvasRuntimeError::not_found("annotation", format!("{}#{}", target_id, index)))?;

        let mut updated = annotation.clone();
        updated.apply_changes(changes, now)?;
        *annotation = updated.clone();
        Ok(updated)
    }

    pub fn delete_annotation(&self, canvas_id: &str, target_id: &str, index: usize) -> Result<Annotation> {
        let mut canvas = self
            .canvases
            .get_mut(canvas_id)
            .ok_or_else(|| CanvasRuntimeError::not_found("canvas", canvas_id))?;
        let list = canvas
            .annotations
            .get_mut(target_id)
            .filter(|list| index < list.len())
            .ok_or_else(|| CanvasRuntimeError::not_found("annotation", format!("{}#{}", target_id, index)))?;

        let removed = list.remove(index);
        if list.is_empty() {
            canvas.annotations.remove(target_id);
        }
        Ok(removed)
    }

    /// Move the newest edit to the redo stack
    pub fn undo(&self, canvas_id: &str) -> Option<EditRecord> {
        let mut canvas = self.canvases.get_mut(canvas_id)?;
        let record = canvas.undo.pop_back()?;
        canvas.redo.push(record.clone());
        Some(record)
    }

    /// Re-apply the most recently undone edit
    pub fn redo(&self, canvas_id: &str) -> Option<EditRecord> {
        let mut canvas = self.canvases.get_mut(canvas_id)?;
        let record = canvas.redo.pop()?;
        canvas.undo.push_back(record.clone());
        Some(record)
    }

    pub fn get_selection_state(&self, canvas_id: &str) -> Option<SelectionState> {
        self.canvases.get(canvas_id).and_then(|c| c.selection.clone())
    }

    pub fn get_navigation_state(&self, canvas_id: &str) -> Option<NavigationState> {
        self.canvases.get(canvas_id).map(|c| c.navigation.clone())
    }

    /// Annotations of a canvas, optionally for a single target
    pub fn get_annotations(&self, canvas_id: &str, target_id: Option<&str>) -> BTreeMap<String, Vec<Annotation>> {
        let Some(canvas) = self.canvases.get(canvas_id) else {
            return BTreeMap::new();
        };
        canvas
            .annotations
            .iter()
            .filter(|(target, _)| target_id.map_or(true, |wanted| wanted == target.as_str()))
            .map(|(target, list)| (target.clone(), list.clone()))
            .collect()
    }

    /// Sizes of the undo and redo stacks
    pub fn history_depth(&self, canvas_id: &str) -> (usize, usize) {
        self.canvases
            .get(canvas_id)
            .map(|c| (c.undo.len(), c.redo.len()))
            .unwrap_or((0, 0))
    }
}

impl Default for CanvasStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit(target: &str, edit_type: &str) -> EditingPayload {
        serde_json::from_value(json!({
            "target_id": target,
            "edit_type": edit_type,
            "before": {"x": 0},
            "after": {"x": 10}
        }))
        .unwrap()
    }

    #[test]
    fn test_undo_redo_stacks() {
        let store = CanvasStateStore::default();
        let now = Utc::now();
        store.apply_edit("c", "A", "alice", &edit("wall-1", "move"), now).unwrap();
        store.apply_edit("c", "A", "alice", &edit("wall-2", "resize"), now).unwrap();

        assert_eq!(store.undo("c").map(|r| r.target_id), Some("wall-2".to_string()));
        assert_eq!(store.history_depth("c"), (1, 1));
        assert_eq!(store.redo("c").map(|r| r.target_id), Some("wall-2".to_string()));
        assert_eq!(store.redo("c"), None);

        store.undo("c");
        store.apply_edit("c", "A", "alice", &edit("wall-3", "modify"), now).unwrap();
        // a fresh edit discards what was undone
        assert_eq!(store.history_depth("c"), (2, 0));
        assert_eq!(store.undo("unknown"), None);
    }

    #[test]
    fn test_edit_validation_and_history_limit() {
        let store = CanvasStateStore::new(2);
        let now = Utc::now();
        assert!(store.apply_edit("c", "A", "alice", &edit("wall-1", "explode"), now).is_err());
        assert!(store.apply_edit("c", "A", "alice", &edit("", "move"), now).is_err());

        for target in ["a", "b", "c"] {
            store.apply_edit("c", "A", "alice", &edit(target, "move"), now).unwrap();
        }
        assert_eq!(store.history_depth("c"), (2, 0));
        assert_eq!(store.undo("c").map(|r| r.target_id), Some("c".to_string()));
        assert_eq!(store.undo("c").map(|r| r.target_id), Some("b".to_string()));
        assert_eq!(store.undo("c"), None);
    }

    #[test]
    fn test_annotation_lifecycle() {
        let store = CanvasStateStore::default();
        let now = Utc::now();
        let payload: AnnotationPayload = serde_json::from_value(json!({
            "target_id": "door-7",
            "content": "check clearance"
        }))
        .unwrap();

        let (index, added) = store.add_annotation("c", "alice", &payload, now).unwrap();
        assert_eq!(index, 0);
        assert_eq!(added.annotation_type, "note");

        let updated = store
            .update_annotation("c", "door-7", 0, &json!({"content": "ok", "tags": ["qa"]}), now)
            .unwrap();
        assert_eq!(updated.content.as_deref(), Some("ok"));
        assert_eq!(updated.tags, vec!["qa".to_string()]);
        assert!(updated.updated_at.is_some());

        assert!(matches!(
            store.update_annotation("c", "door-7", 3, &json!({}), now),
            Err(CanvasRuntimeError::NotFound { .. })
        ));
        assert!(store.update_annotation("c", "door-7", 0, &json!("text"), now).is_err());

        assert_eq!(store.get_annotations("c", Some("door-7"))["door-7"].len(), 1);
        store.delete_annotation("c", "door-7", 0).unwrap();
        assert!(store.get_annotations("c", None).is_empty());
        assert!(store.delete_annotation("c", "door-7", 0).is_err());
    }

    #[test]
    fn test_selection_and_navigation_state() {
        let store = CanvasStateStore::default();
        let now = Utc::now();
        assert_eq!(store.get_selection_state("c"), None);

        let selection: SelectionPayload =
            serde_json::from_value(json!({"selected_ids": ["a", "b"]})).unwrap();
        store.apply_selection("c", "A", "alice", &selection, now);
        assert_eq!(store.get_selection_state("c").unwrap().selected_ids.len(), 2);

        let zoom: NavigationPayload = serde_json::from_value(json!({"action": "zoom", "zoom": 2.5})).unwrap();
        let pan: NavigationPayload =
            serde_json::from_value(json!({"action": "pan", "camera": {"x": 4}})).unwrap();
        store.apply_navigation("c", "alice", &zoom, now);
        let state = store.apply_navigation("c", "bob", &pan, now);

        assert_eq!(state.zoom, Some(2.5));
        assert_eq!(state.camera, Some(json!({"x": 4})));
        assert_eq!(state.last_action.as_deref(), Some("pan"));
        assert_eq!(store.get_navigation_state("c"), Some(state));
    }
}
