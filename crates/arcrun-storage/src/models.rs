// Database models (internal, may differ from domain types)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::JsonValue;
use sqlx::FromRow;

use arcrun_core::{
    actions::StateMap, Event, EventActions, Part, Result, RuntimeError, Session, UsageMetadata,
};

// ============================================
// State rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct AppStateRow {
    pub app_name: String,
    pub state: JsonValue,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserStateRow {
    pub app_name: String,
    pub user_id: String,
    pub state: JsonValue,
    pub update_time: DateTime<Utc>,
}

// ============================================
// Session and event rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    pub state: JsonValue,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl SessionRow {
    /// Converts to a domain session carrying only session-scope state.
    /// The caller merges shared scopes and attaches events.
    pub fn into_session(self) -> Session {
        let mut session = Session::new(self.app_name, self.user_id, self.id);
        session.state = state_map(self.state);
        session.last_update_time = self.update_time;
        session
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub invocation_id: String,
    pub author: String,
    pub branch: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: JsonValue,
    pub actions: JsonValue,
    pub long_running_ids: JsonValue,
    pub usage: Option<JsonValue>,
}

impl EventRow {
    pub fn from_event(session: &Session, event: &Event) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            app_name: session.app_name.clone(),
            user_id: session.user_id.clone(),
            session_id: session.id.clone(),
            invocation_id: event.invocation_id.clone(),
            author: event.author.clone(),
            branch: event.branch.clone(),
            timestamp: event.timestamp,
            content: serde_json::to_value(&event.content).map_err(decode_err)?,
            actions: serde_json::to_value(&event.actions).map_err(decode_err)?,
            long_running_ids: serde_json::to_value(&event.long_running_ids)
                .map_err(decode_err)?,
            usage: event
                .usage
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(decode_err)?,
        })
    }

    pub fn into_event(self) -> Result<Event> {
        let content: Vec<Part> = serde_json::from_value(self.content).map_err(decode_err)?;
        let actions: EventActions = serde_json::from_value(self.actions).map_err(decode_err)?;
        let long_running_ids = serde_json::from_value(self.long_running_ids).map_err(decode_err)?;
        let usage: Option<UsageMetadata> = self
            .usage
            .map(serde_json::from_value)
            .transpose()
            .map_err(decode_err)?;

        let mut event = Event::new(self.invocation_id, self.author);
        event.id = self.id;
        event.timestamp = self.timestamp;
        event.branch = self.branch;
        event.content = content;
        event.actions = actions;
        event.long_running_ids = long_running_ids;
        event.usage = usage;
        Ok(event)
    }
}

/// Interprets a JSONB column as a state map; anything but an object is
/// treated as empty.
pub fn state_map(value: Value) -> StateMap {
    match value {
        Value::Object(map) => map,
        _ => StateMap::new(),
    }
}

fn decode_err(e: serde_json::Error) -> RuntimeError {
    RuntimeError::integrity(format!("stored row does not decode: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_row_round_trip() {
        let session = Session::new("app", "user1", "s1");
        let mut event = Event::new("inv1", "model");
        event.content.push(Part::FunctionCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            args: json!({"city": "Berlin"}),
        });
        event.actions.state_delta =
            json!({"cursor": 5}).as_object().unwrap().clone();
        event.long_running_ids.insert("call_1".into());

        let row = EventRow::from_event(&session, &event).unwrap();
        assert_eq!(row.session_id, "s1");
        let restored = row.into_event().unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_state_map_tolerates_non_objects() {
        assert!(state_map(json!(null)).is_empty());
        assert_eq!(state_map(json!({"k": 1}))["k"], 1);
    }
}
