// Agent Invocation Runtime
//
// This crate provides a storage-agnostic implementation of the
// invocation runtime: an append-only session event log with derived
// scoped state, event-log compaction, concurrent tool-call
// orchestration, and the credential suspend/resume protocol.
//
// Key design decisions:
// - Session state is a derived view: the fold of appended event deltas,
//   with app:/user: scopes shared across sessions and temp: keys never
//   persisted
// - Storage backends plug in via the SessionService trait; appends are
//   read-modify-write against current storage so stale snapshots never
//   lose concurrent writes
// - Compaction never rewrites the log: summaries are ordinary appended
//   events carrying a covered timestamp range, resolved at view time
// - Tool calls in one model turn run concurrently and merge into a
//   single response event; interceptor chains (plugin first, then
//   agent) wrap every call
// - A tool needing external credentials suspends its call; the caller
//   answers a synthetic request_credential call and exactly the ready
//   calls are re-invoked
// - Error handling distinguishes integrity violations (fatal) from
//   commit failures (caller may retry)

pub mod actions;
pub mod auth;
pub mod callbacks;
pub mod compaction;
pub mod error;
pub mod event;
pub mod live;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod session_service;
pub mod tools;

// In-memory implementation for examples and testing
pub mod memory;

// Re-exports for convenience
pub use actions::{EventActions, EventCompaction, StateMap, ToolConfirmation};
pub use auth::{
    generate_auth_event, resume_pending_auth, AuthConfig, AuthToolArguments,
    REQUEST_CREDENTIAL_CALL_NAME, TOOLSET_AUTH_CREDENTIAL_ID_PREFIX,
};
pub use callbacks::{InterceptorChains, ToolInterceptor};
pub use compaction::{build_context, CompactionEngine, CompactionTrigger, EventSummarizer};
pub use error::{Result, RuntimeError};
pub use event::{Event, FunctionCall, FunctionResponse, Part, UsageMetadata};
pub use live::{
    LiveRequestQueue, StopStatus, StreamingRegistry, TranscriptionBuffer,
    STOP_STREAMING_CALL_NAME,
};
pub use memory::InMemorySessionService;
pub use orchestrator::{
    generate_client_call_id, handle_function_calls, handle_function_calls_live,
    merge_parallel_function_response_events, run_turn, ToolPoolConfig, TurnContext, TurnOutcome,
};
pub use pool::{PoolProvider, SharedPoolProvider, WorkerPool};
pub use session::{Session, APP_PREFIX, TEMP_PREFIX, USER_PREFIX};
pub use session_service::{GetSessionConfig, SessionService};
pub use tools::{Tool, ToolContext, ToolKind, ToolRegistry};
