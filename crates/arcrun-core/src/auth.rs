// Credential exchange protocol (suspend/resume)
//
// A tool that needs external credentials sets
// `requested_auth_configs[call_id]` on its response. The orchestrator
// then emits one synthetic long-running `request_credential` call per
// pending call id and ends the turn without resolving the original
// call. When the caller later answers that synthetic call id,
// `resume_pending_auth` locates the ready original call ids by
// scanning the event log backwards and re-invokes exactly those calls.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, RuntimeError};
use crate::event::{Event, Part};
use crate::orchestrator::{generate_client_call_id, handle_function_calls, TurnContext};
use crate::session::{Session, TEMP_PREFIX};
use crate::tools::ToolRegistry;

/// Name of the synthetic long-running call asking the caller to collect
/// credentials.
pub const REQUEST_CREDENTIAL_CALL_NAME: &str = "request_credential";

/// Credential ids with this prefix belong to toolset-level auth: the
/// exchanged credential is cached in session state and no original call
/// is resumed.
pub const TOOLSET_AUTH_CREDENTIAL_ID_PREFIX: &str = "_toolset_auth_";

/// The auth config a tool sends when asking the caller to collect
/// credentials. The runtime and the caller cooperate to fill
/// `exchanged_credential`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// The auth scheme used to collect credentials (e.g. OAuth2
    /// endpoints and scopes). Opaque to the runtime.
    pub auth_scheme: Value,
    /// The raw credential supplied by the tool, for schemes that need
    /// an exchange step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_credential: Option<Value>,
    /// Filled by the caller once the exchange has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchanged_credential: Option<Value>,
    /// Key used to load/save this credential. Derived from the scheme
    /// and raw credential when not supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_key: Option<String>,
}

impl AuthConfig {
    pub fn new(auth_scheme: Value) -> Self {
        Self {
            auth_scheme,
            raw_credential: None,
            exchanged_credential: None,
            credential_key: None,
        }
    }

    /// Parses an auth config from a caller-supplied value.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| RuntimeError::validation(format!("malformed auth config: {e}")))
    }

    /// Returns the configured credential key, or a stable digest over
    /// the scheme and raw credential.
    pub fn credential_key(&self) -> String {
        if let Some(key) = &self.credential_key {
            return key.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&self.auth_scheme));
        if let Some(raw) = &self.raw_credential {
            hasher.update(canonical_json(raw));
        }
        let digest = hex::encode(hasher.finalize());
        format!("auth_{}", &digest[..16])
    }

    /// The state key under which the exchanged credential is cached.
    /// `temp:` scoped: credentials are never persisted to storage.
    pub fn state_key(&self) -> String {
        format!("{TEMP_PREFIX}{}", self.credential_key())
    }
}

/// Serializes a value with object keys sorted, so the digest is stable
/// across insertion orders.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Arguments of the synthetic `request_credential` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToolArguments {
    pub function_call_id: String,
    pub auth_config: AuthConfig,
}

impl AuthToolArguments {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| RuntimeError::validation(format!("malformed auth arguments: {e}")))
    }
}

/// Builds the auth request event for a set of pending auth requests.
///
/// One synthetic long-running `request_credential` call is emitted per
/// suspended call id. Used both for call-level auth (a tool requested
/// credentials during execution) and toolset-level auth (before tool
/// listing).
pub fn build_auth_request_event(
    turn: &TurnContext,
    auth_requests: &HashMap<String, AuthConfig>,
) -> Event {
    let mut event = Event::new(turn.invocation_id.clone(), turn.agent_name.clone());
    event.branch = turn.branch.clone();
    for (function_call_id, auth_config) in auth_requests {
        let call_id = generate_client_call_id();
        event.long_running_ids.insert(call_id.clone());
        event.content.push(Part::FunctionCall {
            id: call_id,
            name: REQUEST_CREDENTIAL_CALL_NAME.to_string(),
            args: json!({
                "function_call_id": function_call_id,
                "auth_config": auth_config,
            }),
        });
    }
    event
}

/// Generates the auth request event for a function response event, or
/// `None` when no call requested credentials.
pub fn generate_auth_event(turn: &TurnContext, response_event: &Event) -> Option<Event> {
    if response_event.actions.requested_auth_configs.is_empty() {
        return None;
    }
    Some(build_auth_request_event(
        turn,
        &response_event.actions.requested_auth_configs,
    ))
}

/// Scans the session log for answered `request_credential` calls,
/// caches the exchanged credentials in session state, and re-invokes
/// exactly the original call ids that are now ready.
///
/// Returns the fresh function-response event, or `None` when there is
/// nothing to resume (including toolset-level auth, where caching the
/// credential is all that is needed).
pub async fn resume_pending_auth(
    turn: &TurnContext,
    session: &mut Session,
    registry: &ToolRegistry,
) -> Result<Option<Event>> {
    let events = &session.events;
    // The auth responses arrive as the last user-authored content event.
    let Some(last_event) = events.iter().rev().find(|e| e.has_content()) else {
        return Ok(None);
    };
    if last_event.author != "user" {
        return Ok(None);
    }

    let responses = last_event.function_responses();
    let answered_ids: HashSet<String> = responses
        .iter()
        .filter(|r| r.name == REQUEST_CREDENTIAL_CALL_NAME)
        .map(|r| r.id.clone())
        .collect();
    if answered_ids.is_empty() {
        return Ok(None);
    }

    // Recover the originally requested configs, keyed by synthetic call id.
    let mut requested_by_request_id: HashMap<String, AuthToolArguments> = HashMap::new();
    for event in events {
        for call in event.function_calls() {
            if call.name == REQUEST_CREDENTIAL_CALL_NAME && answered_ids.contains(&call.id) {
                requested_by_request_id.insert(call.id.clone(), AuthToolArguments::from_value(&call.args)?);
            }
        }
    }

    // Cache every exchanged credential in session state.
    for response in &responses {
        if response.name != REQUEST_CREDENTIAL_CALL_NAME {
            continue;
        }
        let mut auth_config = AuthConfig::from_value(&response.response)?;
        if auth_config.credential_key.is_none() {
            if let Some(requested) = requested_by_request_id.get(&response.id) {
                auth_config.credential_key = requested.auth_config.credential_key.clone();
            }
        }
        let credential = auth_config
            .exchanged_credential
            .clone()
            .unwrap_or(Value::Null);
        session.state.insert(auth_config.state_key(), credential);
    }

    // Backward scan: find the auth request event, collect the original
    // call ids that are ready to resume, then find the event carrying
    // those original calls and re-invoke exactly them.
    for (i, event) in events.iter().enumerate().rev().skip(1) {
        let function_calls = event.function_calls();
        if function_calls.is_empty() {
            continue;
        }

        let mut calls_to_resume: HashSet<String> = HashSet::new();
        for call in &function_calls {
            if !answered_ids.contains(&call.id) {
                continue;
            }
            let args = AuthToolArguments::from_value(&call.args)?;
            // Toolset-level auth: credential is cached above, nothing to
            // resume.
            if args
                .function_call_id
                .starts_with(TOOLSET_AUTH_CREDENTIAL_ID_PREFIX)
            {
                continue;
            }
            calls_to_resume.insert(args.function_call_id);
        }
        if calls_to_resume.is_empty() {
            continue;
        }

        for original_event in events[..i].iter().rev() {
            let original_calls = original_event.function_calls();
            if original_calls.is_empty() {
                continue;
            }
            if original_calls.iter().any(|c| calls_to_resume.contains(&c.id)) {
                let original_event = original_event.clone();
                return handle_function_calls(
                    turn,
                    &original_event,
                    registry,
                    Some(&calls_to_resume),
                )
                .await;
            }
        }
        return Ok(None);
    }
    Ok(None)
}
