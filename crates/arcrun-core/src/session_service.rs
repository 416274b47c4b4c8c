// SessionService - the storage contract for sessions and their logs
//
// Implementations own the authoritative copies of the three state
// scopes. `append_event` is the only write path for events and state:
// it must apply the event's state delta against current storage under
// a per-session critical section, so appends through stale Session
// snapshots never lose keys written by concurrent appends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::actions::StateMap;
use crate::error::Result;
use crate::event::Event;
use crate::session::Session;

/// Controls how much of a session's log `get_session` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetSessionConfig {
    /// Keep only the newest N events.
    pub num_recent_events: Option<usize>,
    /// Keep only events at or after this timestamp. Takes precedence
    /// over `num_recent_events` when both are set.
    pub after_timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session. A caller-supplied id must not collide with an
    /// existing session of the same app and user; `state` is split by
    /// scope prefix, with `temp:` keys dropped.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<String>,
        state: StateMap,
    ) -> Result<Session>;

    /// Returns a snapshot of the session, its merged state view built
    /// from current storage, or `None` when it does not exist.
    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>>;

    /// Lists a user's sessions, without events or state.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>>;

    /// Deletes a session and its events. Shared app/user state is
    /// untouched.
    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()>;

    /// Appends an event to the session's log, applies its state delta
    /// scope by scope against current storage, and advances
    /// `last_update_time` to the event's timestamp. The caller's
    /// snapshot is updated in place. Partial events are returned
    /// unchanged and never persisted.
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event>;
}

/// Applies `config` to a full event list.
pub(crate) fn filter_events(events: &[Event], config: GetSessionConfig) -> Vec<Event> {
    if let Some(after) = config.after_timestamp {
        return events
            .iter()
            .filter(|e| e.timestamp >= after)
            .cloned()
            .collect();
    }
    if let Some(count) = config.num_recent_events {
        let skip = events.len().saturating_sub(count);
        return events[skip..].to_vec();
    }
    events.to_vec()
}
