// EventActions - the side-effect bundle attached to an event
//
// Every slot is optional. Merging two bundles is explicit per slot
// kind: dict-valued slots deep-merge key-by-key, scalar slots take the
// later value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::AuthConfig;

/// State key/value map as carried in `state_delta` and session state.
pub type StateMap = Map<String, Value>;

/// A closed range of raw events folded into a summary. The range is
/// immutable once the carrying event is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCompaction {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    /// Summary text standing in for the raw events in the range.
    pub compacted_content: String,
}

/// A pending request for the caller to confirm a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfirmation {
    pub hint: String,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Side effects requested by the author of an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// Keys to merge into scoped session state. `app:`/`user:` prefixed
    /// keys land in shared scopes, `temp:` keys are never persisted.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state_delta: StateMap,

    /// Artifact name -> version written during the turn.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifact_delta: HashMap<String, i64>,

    /// Present iff the event is a compaction marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<EventCompaction>,

    /// Call id -> auth config for calls suspended pending credentials.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub requested_auth_configs: HashMap<String, AuthConfig>,

    /// Call id -> confirmation request for calls pending user approval.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub requested_tool_confirmations: HashMap<String, ToolConfirmation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalate: Option<bool>,
}

impl EventActions {
    pub fn with_state_delta(state_delta: StateMap) -> Self {
        Self {
            state_delta,
            ..Default::default()
        }
    }

    /// Merges `later` into `self`, slot by slot. Dict slots merge
    /// recursively with later-wins on leaf conflicts; scalar slots take
    /// the later value when present.
    pub fn merge(&mut self, later: &EventActions) {
        for (key, value) in &later.state_delta {
            match (self.state_delta.get_mut(key), value) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    deep_merge_objects(existing, incoming);
                }
                _ => {
                    self.state_delta.insert(key.clone(), value.clone());
                }
            }
        }
        for (name, version) in &later.artifact_delta {
            self.artifact_delta.insert(name.clone(), *version);
        }
        if later.compaction.is_some() {
            self.compaction = later.compaction.clone();
        }
        for (call_id, config) in &later.requested_auth_configs {
            self.requested_auth_configs
                .insert(call_id.clone(), config.clone());
        }
        for (call_id, confirmation) in &later.requested_tool_confirmations {
            self.requested_tool_confirmations
                .insert(call_id.clone(), confirmation.clone());
        }
        if later.escalate.is_some() {
            self.escalate = later.escalate;
        }
    }
}

/// Recursively merges `incoming` into `existing`. Non-object leaf
/// conflicts take the incoming value.
pub fn deep_merge_objects(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (existing.get_mut(key), value) {
            (Some(Value::Object(sub_existing)), Value::Object(sub_incoming)) => {
                deep_merge_objects(sub_existing, sub_incoming);
            }
            _ => {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> StateMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_merge_later_wins_on_leaf_conflict() {
        let mut first = EventActions::with_state_delta(state(json!({"a": 1})));
        let second = EventActions::with_state_delta(state(json!({"a": 2, "b": 3})));

        first.merge(&second);

        assert_eq!(first.state_delta, state(json!({"a": 2, "b": 3})));
    }

    #[test]
    fn test_merge_recurses_into_nested_objects() {
        let mut first =
            EventActions::with_state_delta(state(json!({"cfg": {"x": 1, "keep": true}})));
        let second = EventActions::with_state_delta(state(json!({"cfg": {"x": 2, "y": 3}})));

        first.merge(&second);

        assert_eq!(
            first.state_delta,
            state(json!({"cfg": {"x": 2, "y": 3, "keep": true}}))
        );
    }

    #[test]
    fn test_merge_scalar_slots() {
        let mut first = EventActions::default();
        let mut second = EventActions::default();
        second.escalate = Some(true);
        second.artifact_delta.insert("report.md".into(), 2);

        first.merge(&second);

        assert_eq!(first.escalate, Some(true));
        assert_eq!(first.artifact_delta.get("report.md"), Some(&2));
    }
}
