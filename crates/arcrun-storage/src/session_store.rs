// Database-backed SessionService implementation
//
// All appends run inside one transaction: the event insert and every
// scoped state update commit together or not at all. Row locks are
// taken by the UPDATE statements themselves; a scoped update that
// matches no row aborts the transaction with an integrity error.

use async_trait::async_trait;
use sqlx::types::JsonValue;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

use arcrun_core::{
    actions::StateMap,
    session::{merge_scoped_state, split_state_by_scope},
    Event, GetSessionConfig, Result, RuntimeError, Session, SessionService, TEMP_PREFIX,
};

use crate::models::{state_map, EventRow, SessionRow};

/// PostgreSQL-backed session service
#[derive(Clone)]
pub struct PostgresSessionService {
    pool: PgPool,
}

impl PostgresSessionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a service from a connection URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("migration failed: {e}")))
    }

    async fn load_events(
        &self,
        session: &SessionRow,
        config: Option<GetSessionConfig>,
    ) -> Result<Vec<Event>> {
        let config = config.unwrap_or_default();
        let rows: Vec<EventRow> = if let Some(after) = config.after_timestamp {
            sqlx::query_as(
                r#"
                SELECT id, app_name, user_id, session_id, invocation_id, author, branch,
                       timestamp, content, actions, long_running_ids, usage
                FROM events
                WHERE app_name = $1 AND user_id = $2 AND session_id = $3 AND timestamp >= $4
                ORDER BY timestamp ASC, id ASC
                "#,
            )
            .bind(&session.app_name)
            .bind(&session.user_id)
            .bind(&session.id)
            .bind(after)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
        } else if let Some(count) = config.num_recent_events {
            let mut rows: Vec<EventRow> = sqlx::query_as(
                r#"
                SELECT id, app_name, user_id, session_id, invocation_id, author, branch,
                       timestamp, content, actions, long_running_ids, usage
                FROM events
                WHERE app_name = $1 AND user_id = $2 AND session_id = $3
                ORDER BY timestamp DESC, id DESC
                LIMIT $4
                "#,
            )
            .bind(&session.app_name)
            .bind(&session.user_id)
            .bind(&session.id)
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.reverse();
            rows
        } else {
            sqlx::query_as(
                r#"
                SELECT id, app_name, user_id, session_id, invocation_id, author, branch,
                       timestamp, content, actions, long_running_ids, usage
                FROM events
                WHERE app_name = $1 AND user_id = $2 AND session_id = $3
                ORDER BY timestamp ASC, id ASC
                "#,
            )
            .bind(&session.app_name)
            .bind(&session.user_id)
            .bind(&session.id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
        };

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn scope_state(&self, app_name: &str, user_id: &str) -> Result<(StateMap, StateMap)> {
        let app: Option<(JsonValue,)> =
            sqlx::query_as("SELECT state FROM app_state WHERE app_name = $1")
                .bind(app_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        let user: Option<(JsonValue,)> =
            sqlx::query_as("SELECT state FROM user_state WHERE app_name = $1 AND user_id = $2")
                .bind(app_name)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok((
            app.map(|(v,)| state_map(v)).unwrap_or_default(),
            user.map(|(v,)| state_map(v)).unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl SessionService for PostgresSessionService {
    #[instrument(skip(self, state))]
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<String>,
        state: StateMap,
    ) -> Result<Session> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let (app, user, session_scope) = split_state_by_scope(&state);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let (app_state,): (JsonValue,) = sqlx::query_as(
            r#"
            INSERT INTO app_state (app_name, state) VALUES ($1, $2)
            ON CONFLICT (app_name)
            DO UPDATE SET state = app_state.state || EXCLUDED.state, update_time = now()
            RETURNING state
            "#,
        )
        .bind(app_name)
        .bind(JsonValue::Object(app))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let (user_state,): (JsonValue,) = sqlx::query_as(
            r#"
            INSERT INTO user_state (app_name, user_id, state) VALUES ($1, $2, $3)
            ON CONFLICT (app_name, user_id)
            DO UPDATE SET state = user_state.state || EXCLUDED.state, update_time = now()
            RETURNING state
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .bind(JsonValue::Object(user))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            INSERT INTO sessions (app_name, user_id, id, state) VALUES ($1, $2, $3, $4)
            ON CONFLICT (app_name, user_id, id) DO NOTHING
            RETURNING app_name, user_id, id, state, create_time, update_time
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .bind(&id)
        .bind(JsonValue::Object(session_scope))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(RuntimeError::already_exists(format!(
                "session '{id}' already exists for app '{app_name}', user '{user_id}'"
            )));
        };

        tx.commit()
            .await
            .map_err(|e| RuntimeError::commit(e.to_string()))?;

        let mut session = row.into_session();
        session.state = merge_scoped_state(&state_map(app_state), &state_map(user_state), &session.state);
        debug!(app_name, user_id, session_id = %session.id, "session created");
        Ok(session)
    }

    #[instrument(skip(self, config))]
    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT app_name, user_id, id, state, create_time, update_time
            FROM sessions
            WHERE app_name = $1 AND user_id = $2 AND id = $3
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let events = self.load_events(&row, config).await?;
        let (app, user) = self.scope_state(app_name, user_id).await?;

        let mut session = row.into_session();
        session.state = merge_scoped_state(&app, &user, &session.state);
        session.events = events;
        Ok(Some(session))
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT app_name, user_id, id, state, create_time, update_time
            FROM sessions
            WHERE app_name = $1 AND user_id = $2
            ORDER BY id
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut session = row.into_session();
                session.state = StateMap::new();
                session
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
        // Events go with the session via the cascading foreign key.
        sqlx::query("DELETE FROM sessions WHERE app_name = $1 AND user_id = $2 AND id = $3")
            .bind(app_name)
            .bind(user_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, session, event), fields(session_id = %session.id))]
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        if event.partial {
            return Ok(event);
        }

        let row = EventRow::from_event(session, &event)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Every failure rolls back explicitly before surfacing, so the
        // pooled connection is never returned mid-transaction.
        if let Err(err) = apply_append(&mut tx, session, &event, &row).await {
            tx.rollback().await.ok();
            return Err(err);
        }

        tx.commit().await.map_err(|e| {
            error!("append transaction failed to commit: {e}");
            RuntimeError::commit(e.to_string())
        })?;

        // Keep the caller's snapshot consistent with what it observed.
        for (key, value) in &event.actions.state_delta {
            if !key.starts_with(TEMP_PREFIX) {
                session.state.insert(key.clone(), value.clone());
            }
        }
        session.events.push(event.clone());
        session.last_update_time = event.timestamp;
        Ok(event)
    }
}

/// Runs the writes of one append inside the caller's transaction:
/// scoped state updates (taking their row locks), the session row bump,
/// and the event insert.
async fn apply_append(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session: &Session,
    event: &Event,
    row: &EventRow,
) -> Result<()> {
    let (app, user, session_scope) = split_state_by_scope(&event.actions.state_delta);

    if !app.is_empty() {
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE app_state SET state = state || $2, update_time = now()
            WHERE app_name = $1
            RETURNING app_name
            "#,
        )
        .bind(&session.app_name)
        .bind(JsonValue::Object(app))
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        if updated.is_none() {
            return Err(RuntimeError::integrity(format!(
                "app state missing for app '{}'",
                session.app_name
            )));
        }
    }

    if !user.is_empty() {
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE user_state SET state = state || $3, update_time = now()
            WHERE app_name = $1 AND user_id = $2
            RETURNING user_id
            "#,
        )
        .bind(&session.app_name)
        .bind(&session.user_id)
        .bind(JsonValue::Object(user))
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        if updated.is_none() {
            return Err(RuntimeError::integrity(format!(
                "user state missing for user '{}'",
                session.user_id
            )));
        }
    }

    let updated: Option<(String,)> = sqlx::query_as(
        r#"
        UPDATE sessions SET state = state || $4, update_time = $5
        WHERE app_name = $1 AND user_id = $2 AND id = $3
        RETURNING id
        "#,
    )
    .bind(&session.app_name)
    .bind(&session.user_id)
    .bind(&session.id)
    .bind(JsonValue::Object(session_scope))
    .bind(event.timestamp)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    if updated.is_none() {
        return Err(RuntimeError::integrity(format!(
            "session '{}' not found for append",
            session.id
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO events (id, app_name, user_id, session_id, invocation_id, author,
                            branch, timestamp, content, actions, long_running_ids, usage)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&row.id)
    .bind(&row.app_name)
    .bind(&row.user_id)
    .bind(&row.session_id)
    .bind(&row.invocation_id)
    .bind(&row.author)
    .bind(&row.branch)
    .bind(row.timestamp)
    .bind(&row.content)
    .bind(&row.actions)
    .bind(&row.long_running_ids)
    .bind(&row.usage)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(())
}

fn db_err(e: sqlx::Error) -> RuntimeError {
    RuntimeError::Internal(anyhow::anyhow!("database error: {e}"))
}
