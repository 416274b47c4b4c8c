// Postgres storage layer with sqlx
//
// This crate provides the database implementation of the core
// SessionService trait:
// - PostgresSessionService: transactional event appends with scoped
//   state rows, so concurrent appends through stale snapshots never
//   lose state

pub mod models;
pub mod session_store;

pub use models::{AppStateRow, EventRow, SessionRow, UserStateRow};
pub use session_store::PostgresSessionService;
