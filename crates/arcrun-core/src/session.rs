// Session domain type and state scoping
//
// A session's `state` is a derived view: the fold of every non-partial
// event's `state_delta` in timestamp order, with `app:`/`user:`
// prefixed keys shared across sessions and `temp:` keys never
// persisted. The authoritative copies of the shared scopes live in
// storage, not in any caller's Session snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::StateMap;
use crate::event::Event;

/// Keys with this prefix are shared by all sessions of an app.
pub const APP_PREFIX: &str = "app:";
/// Keys with this prefix are shared by all sessions of one user.
pub const USER_PREFIX: &str = "user:";
/// Keys with this prefix exist only transiently during a turn.
pub const TEMP_PREFIX: &str = "temp:";

/// Session - one append-only event log plus its merged state view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    /// Merged view over app, user and session scopes. May be stale
    /// relative to storage; never authoritative for shared scopes.
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub events: Vec<Event>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            id: id.into(),
            state: StateMap::new(),
            events: Vec::new(),
            last_update_time: Utc::now(),
        }
    }
}

/// Splits a raw state map into (app, user, session) scoped maps,
/// dropping `temp:` keys. Prefixes are stripped from the shared keys.
pub fn split_state_by_scope(state: &StateMap) -> (StateMap, StateMap, StateMap) {
    let mut app = StateMap::new();
    let mut user = StateMap::new();
    let mut session = StateMap::new();
    for (key, value) in state {
        if let Some(stripped) = key.strip_prefix(APP_PREFIX) {
            app.insert(stripped.to_string(), value.clone());
        } else if let Some(stripped) = key.strip_prefix(USER_PREFIX) {
            user.insert(stripped.to_string(), value.clone());
        } else if !key.starts_with(TEMP_PREFIX) {
            session.insert(key.clone(), value.clone());
        }
    }
    (app, user, session)
}

/// Builds the merged state view from the three scoped maps, restoring
/// the `app:`/`user:` prefixes.
pub fn merge_scoped_state(app: &StateMap, user: &StateMap, session: &StateMap) -> StateMap {
    let mut merged = StateMap::new();
    for (key, value) in app {
        merged.insert(format!("{APP_PREFIX}{key}"), value.clone());
    }
    for (key, value) in user {
        merged.insert(format!("{USER_PREFIX}{key}"), value.clone());
    }
    for (key, value) in session {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Returns `delta` with `temp:` keys removed. What remains is what may
/// be persisted.
pub fn strip_temp_keys(delta: &StateMap) -> StateMap {
    delta
        .iter()
        .filter(|(key, _)| !key.starts_with(TEMP_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Folds the `state_delta` of every non-partial event into `state`, in
/// the order given. The fold is idempotent for a fixed event list.
pub fn fold_state(state: &mut StateMap, events: &[Event]) {
    for event in events {
        if event.partial {
            continue;
        }
        for (key, value) in strip_temp_keys(&event.actions.state_delta) {
            state.insert(key, value);
        }
    }
}
