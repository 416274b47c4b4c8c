// In-memory SessionService
//
// Authoritative state lives in the service's own maps, keyed by app,
// (app, user) and (app, user, session). One async lock serializes every
// append, which gives the read-modify-write contract directly: a stale
// caller snapshot only decides which session the delta applies to, the
// delta itself merges into current storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::actions::StateMap;
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::session::{
    merge_scoped_state, split_state_by_scope, Session, APP_PREFIX, TEMP_PREFIX, USER_PREFIX,
};
use crate::session_service::{filter_events, GetSessionConfig, SessionService};

#[derive(Default)]
struct Inner {
    app_state: HashMap<String, StateMap>,
    user_state: HashMap<(String, String), StateMap>,
    sessions: HashMap<(String, String, String), Session>,
}

#[derive(Default)]
pub struct InMemorySessionService {
    inner: Mutex<Inner>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<String>,
        state: StateMap,
    ) -> Result<Session> {
        let id = match session_id {
            Some(id) => id,
            None => Uuid::now_v7().to_string(),
        };
        let key = (app_name.to_string(), user_id.to_string(), id.clone());

        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&key) {
            return Err(RuntimeError::already_exists(format!(
                "session '{id}' already exists for app '{app_name}', user '{user_id}'"
            )));
        }

        let (app, user, session_scope) = split_state_by_scope(&state);
        let app_row = inner
            .app_state
            .entry(app_name.to_string())
            .or_default();
        app_row.extend(app);
        let user_row = inner
            .user_state
            .entry((app_name.to_string(), user_id.to_string()))
            .or_default();
        user_row.extend(user);

        let mut session = Session::new(app_name, user_id, id);
        session.state = session_scope;
        inner.sessions.insert(key, session.clone());

        session.state = merge_scoped_state(
            &inner.app_state[app_name],
            &inner.user_state[&(app_name.to_string(), user_id.to_string())],
            &session.state,
        );
        debug!(app_name, user_id, session_id = %session.id, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>> {
        let inner = self.inner.lock().await;
        let key = (
            app_name.to_string(),
            user_id.to_string(),
            session_id.to_string(),
        );
        let Some(stored) = inner.sessions.get(&key) else {
            return Ok(None);
        };

        let mut session = stored.clone();
        session.state = merge_scoped_state(
            inner.app_state.get(app_name).unwrap_or(&StateMap::new()),
            inner
                .user_state
                .get(&(app_name.to_string(), user_id.to_string()))
                .unwrap_or(&StateMap::new()),
            &stored.state,
        );
        if let Some(config) = config {
            session.events = filter_events(&stored.events, config);
        }
        Ok(Some(session))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.app_name == app_name && s.user_id == user_id)
            .map(|s| {
                let mut copy = s.clone();
                copy.events = Vec::new();
                copy.state = StateMap::new();
                copy
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(&(
            app_name.to_string(),
            user_id.to_string(),
            session_id.to_string(),
        ));
        Ok(())
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        if event.partial {
            return Ok(event);
        }

        let key = (
            session.app_name.clone(),
            session.user_id.clone(),
            session.id.clone(),
        );

        {
            let mut inner = self.inner.lock().await;
            if !inner.sessions.contains_key(&key) {
                return Err(RuntimeError::integrity(format!(
                    "session '{}' not found for append",
                    session.id
                )));
            }

            for (state_key, value) in &event.actions.state_delta {
                if let Some(stripped) = state_key.strip_prefix(APP_PREFIX) {
                    let row = inner.app_state.get_mut(&session.app_name).ok_or_else(|| {
                        RuntimeError::integrity(format!(
                            "app state missing for app '{}'",
                            session.app_name
                        ))
                    })?;
                    row.insert(stripped.to_string(), value.clone());
                } else if let Some(stripped) = state_key.strip_prefix(USER_PREFIX) {
                    let row = inner
                        .user_state
                        .get_mut(&(session.app_name.clone(), session.user_id.clone()))
                        .ok_or_else(|| {
                            RuntimeError::integrity(format!(
                                "user state missing for user '{}'",
                                session.user_id
                            ))
                        })?;
                    row.insert(stripped.to_string(), value.clone());
                } else if !state_key.starts_with(TEMP_PREFIX) {
                    let stored = inner.sessions.get_mut(&key).expect("checked above");
                    stored.state.insert(state_key.clone(), value.clone());
                }
            }

            let stored = inner.sessions.get_mut(&key).expect("checked above");
            stored.events.push(event.clone());
            stored.last_update_time = event.timestamp;
        }

        // Keep the caller's snapshot consistent with what it observed.
        for (state_key, value) in &event.actions.state_delta {
            if !state_key.starts_with(TEMP_PREFIX) {
                session.state.insert(state_key.clone(), value.clone());
            }
        }
        session.events.push(event.clone());
        session.last_update_time = event.timestamp;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::EventActions;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn state(value: serde_json::Value) -> StateMap {
        value.as_object().unwrap().clone()
    }

    fn delta_event(seconds: i64, delta: serde_json::Value) -> Event {
        let mut event = Event::new("inv1", "user");
        event.timestamp = Utc.timestamp_opt(seconds, 0).unwrap();
        event.actions = EventActions::with_state_delta(state(delta));
        event
    }

    #[tokio::test]
    async fn test_create_session_merges_scoped_state() {
        let service = InMemorySessionService::new();
        let session = service
            .create_session(
                "app",
                "user1",
                None,
                state(json!({"app:model": "m1", "user:lang": "de", "cursor": 0, "temp:x": 1})),
            )
            .await
            .unwrap();

        assert_eq!(session.state["app:model"], "m1");
        assert_eq!(session.state["user:lang"], "de");
        assert_eq!(session.state["cursor"], 0);
        assert!(!session.state.contains_key("temp:x"));
    }

    #[tokio::test]
    async fn test_create_session_rejects_duplicate_id() {
        let service = InMemorySessionService::new();
        service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();
        let err = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_app_state_is_shared_across_sessions() {
        let service = InMemorySessionService::new();
        let mut first = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();
        service
            .create_session("app", "user2", Some("s2".into()), StateMap::new())
            .await
            .unwrap();

        service
            .append_event(&mut first, delta_event(10, json!({"app:theme": "dark"})))
            .await
            .unwrap();

        let other = service
            .get_session("app", "user2", "s2", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.state["app:theme"], "dark");
    }

    #[tokio::test]
    async fn test_user_state_not_visible_to_other_users() {
        let service = InMemorySessionService::new();
        let mut first = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();
        service
            .create_session("app", "user2", Some("s2".into()), StateMap::new())
            .await
            .unwrap();

        service
            .append_event(&mut first, delta_event(10, json!({"user:lang": "de"})))
            .await
            .unwrap();

        let other = service
            .get_session("app", "user2", "s2", None)
            .await
            .unwrap()
            .unwrap();
        assert!(!other.state.contains_key("user:lang"));
    }

    #[tokio::test]
    async fn test_temp_state_never_persisted() {
        let service = InMemorySessionService::new();
        let mut session = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();

        service
            .append_event(
                &mut session,
                delta_event(10, json!({"temp:scratch": 1, "kept": 2})),
            )
            .await
            .unwrap();

        let fetched = service
            .get_session("app", "user1", "s1", None)
            .await
            .unwrap()
            .unwrap();
        assert!(!fetched.state.contains_key("temp:scratch"));
        assert_eq!(fetched.state["kept"], 2);
    }

    #[tokio::test]
    async fn test_partial_events_are_not_persisted() {
        let service = InMemorySessionService::new();
        let mut session = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();

        let mut event = delta_event(10, json!({"k": "v"}));
        event.partial = true;
        service.append_event(&mut session, event).await.unwrap();

        let fetched = service
            .get_session("app", "user1", "s1", None)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.events.is_empty());
        assert!(!fetched.state.contains_key("k"));
    }

    #[tokio::test]
    async fn test_last_update_time_follows_event_timestamp() {
        let service = InMemorySessionService::new();
        let mut session = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();

        let event = delta_event(1_700_000_000, json!({}));
        let expected = event.timestamp;
        service.append_event(&mut session, event).await.unwrap();

        assert_eq!(session.last_update_time, expected);
        let fetched = service
            .get_session("app", "user1", "s1", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.last_update_time, expected);
    }

    #[tokio::test]
    async fn test_concurrent_stale_appends_preserve_all_keys() {
        use std::sync::Arc;

        let service = Arc::new(InMemorySessionService::new());
        service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();

        // Two snapshots of the same session, each unaware of the
        // other's write.
        for round in 0..5 {
            let latest = service
                .get_session("app", "user1", "s1", None)
                .await
                .unwrap()
                .unwrap();
            let mut stale_a = latest.clone();
            let mut stale_b = latest.clone();

            let key_a = format!("user:a{round}");
            let key_b = format!("user:b{round}");
            let event_a = delta_event(100 + round, json!({ (key_a.clone()): round }));
            let event_b = delta_event(200 + round, json!({ (key_b.clone()): round }));

            let service_a = Arc::clone(&service);
            let service_b = Arc::clone(&service);
            let (ra, rb) = tokio::join!(
                async move { service_a.append_event(&mut stale_a, event_a).await },
                async move { service_b.append_event(&mut stale_b, event_b).await },
            );
            ra.unwrap();
            rb.unwrap();
        }

        let merged = service
            .get_session("app", "user1", "s1", None)
            .await
            .unwrap()
            .unwrap();
        for round in 0..5 {
            assert!(merged.state.contains_key(&format!("user:a{round}")));
            assert!(merged.state.contains_key(&format!("user:b{round}")));
        }
        assert_eq!(merged.events.len(), 10);
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_is_an_integrity_error() {
        let service = InMemorySessionService::new();
        let mut ghost = Session::new("app", "user1", "missing");
        let err = service
            .append_event(&mut ghost, delta_event(1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_get_session_event_filters() {
        let service = InMemorySessionService::new();
        let mut session = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();
        for i in 1..=10 {
            service
                .append_event(&mut session, delta_event(i, json!({})))
                .await
                .unwrap();
        }

        let recent = service
            .get_session(
                "app",
                "user1",
                "s1",
                Some(GetSessionConfig {
                    num_recent_events: Some(3),
                    after_timestamp: None,
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recent.events.len(), 3);
        assert_eq!(
            recent.events[0].timestamp,
            Utc.timestamp_opt(8, 0).unwrap()
        );

        // The timestamp bound is inclusive and takes precedence.
        let after = service
            .get_session(
                "app",
                "user1",
                "s1",
                Some(GetSessionConfig {
                    num_recent_events: Some(3),
                    after_timestamp: Some(Utc.timestamp_opt(4, 0).unwrap()),
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.events.len(), 7);
        assert_eq!(after.events[0].timestamp, Utc.timestamp_opt(4, 0).unwrap());
    }

    #[tokio::test]
    async fn test_list_and_delete_sessions() {
        let service = InMemorySessionService::new();
        let mut session = service
            .create_session("app", "user1", Some("s1".into()), StateMap::new())
            .await
            .unwrap();
        service
            .create_session("app", "user1", Some("s2".into()), StateMap::new())
            .await
            .unwrap();
        service
            .append_event(&mut session, delta_event(1, json!({"k": "v"})))
            .await
            .unwrap();

        let listed = service.list_sessions("app", "user1").await.unwrap();
        assert_eq!(listed.len(), 2);
        // Listing carries neither events nor state.
        assert!(listed.iter().all(|s| s.events.is_empty() && s.state.is_empty()));

        service.delete_session("app", "user1", "s1").await.unwrap();
        assert!(service
            .get_session("app", "user1", "s1", None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(service.list_sessions("app", "user1").await.unwrap().len(), 1);
    }
}
