// Event entity type
//
// An Event is one atomic, timestamped, appended record in a session's
// log. Events are immutable once appended; derived session state is a
// fold over their `actions.state_delta`s.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::actions::EventActions;

/// One ordered piece of an event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        id: String,
        name: String,
        #[serde(default)]
        args: Value,
    },
    FunctionResponse {
        id: String,
        name: String,
        #[serde(default)]
        response: Value,
    },
}

/// A function call extracted from an event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// A function response extracted from an event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Token accounting reported by the model for the turn that produced
/// an event. Only `prompt_tokens` is consumed here (by the
/// token-threshold compaction trigger); the rest is carried through
/// for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Event - one atomic record in the session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub content: Vec<Part>,
    #[serde(default)]
    pub actions: EventActions,
    /// Call ids of long-running tool invocations issued by this event.
    #[serde(default)]
    pub long_running_ids: HashSet<String>,
    /// In-progress events are never persisted.
    #[serde(default)]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Event::new_id(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            timestamp: Utc::now(),
            branch: None,
            content: Vec::new(),
            actions: EventActions::default(),
            long_running_ids: HashSet::new(),
            partial: false,
            usage: None,
        }
    }

    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Returns the function calls carried in this event's content.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.content
            .iter()
            .filter_map(|part| match part {
                Part::FunctionCall { id, name, args } => Some(FunctionCall {
                    id: id.clone(),
                    name: name.clone(),
                    args: args.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Returns the function responses carried in this event's content.
    pub fn function_responses(&self) -> Vec<FunctionResponse> {
        self.content
            .iter()
            .filter_map(|part| match part {
                Part::FunctionResponse { id, name, response } => Some(FunctionResponse {
                    id: id.clone(),
                    name: name.clone(),
                    response: response.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// True if this event is a compaction marker.
    pub fn is_compaction(&self) -> bool {
        self.actions.compaction.is_some()
    }

    /// Total text characters across this event's parts. Used by the
    /// token estimator.
    pub fn text_len(&self) -> usize {
        self.content
            .iter()
            .map(|part| match part {
                Part::Text { text } => text.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}
