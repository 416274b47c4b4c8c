// Tool-call orchestration
//
// Consumes a model-turn event's function calls and dispatches them as
// independent concurrent tasks against the tool registry. Per call:
// resolve -> before interceptors -> execute -> after interceptors,
// with on-error interceptors as the only rescue path for failures.
// The per-call response events are merged into one event, parts in
// original call order. A call that requested credentials or
// confirmation suspends the turn instead of finishing it.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::build_auth_request_event;
use crate::callbacks::InterceptorChains;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, FunctionCall, Part};
use crate::live::{
    LiveRequestQueue, StopStatus, StreamingRegistry, STOP_STREAMING_CALL_NAME,
};
use crate::pool::PoolProvider;
use crate::tools::{NotFoundTool, Tool, ToolContext, ToolKind, ToolRegistry};

/// Prefix of client-generated call ids, distinguishing them from
/// model-supplied ids.
pub const CLIENT_CALL_ID_PREFIX: &str = "arc-";

/// Name of the synthetic long-running call asking the caller to confirm
/// a tool call.
pub const REQUEST_CONFIRMATION_CALL_NAME: &str = "request_confirmation";

pub fn generate_client_call_id() -> String {
    format!("{CLIENT_CALL_ID_PREFIX}{}", Uuid::now_v7())
}

/// Assigns client-generated ids to function calls the model emitted
/// without one.
pub fn populate_client_call_ids(event: &mut Event) {
    for part in &mut event.content {
        if let Part::FunctionCall { id, .. } = part {
            if id.is_empty() {
                *id = generate_client_call_id();
            }
        }
    }
}

/// Pool configuration for a turn. When present, blocking tools run
/// inside the worker pool of the given size.
#[derive(Debug, Clone, Copy)]
pub struct ToolPoolConfig {
    pub max_workers: usize,
}

/// Everything the orchestrator needs for one invocation.
pub struct TurnContext {
    pub invocation_id: String,
    /// Author of events produced by this turn.
    pub agent_name: String,
    pub branch: Option<String>,
    pub interceptors: InterceptorChains,
    pub pool_provider: Option<Arc<dyn PoolProvider>>,
    pub pool_config: Option<ToolPoolConfig>,
    /// Active streaming tools, one registry per invocation.
    pub streaming: Arc<StreamingRegistry>,
    pub live_queue: Option<LiveRequestQueue>,
}

impl TurnContext {
    pub fn new(invocation_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            branch: None,
            interceptors: InterceptorChains::default(),
            pool_provider: None,
            pool_config: None,
            streaming: Arc::new(StreamingRegistry::new()),
            live_queue: None,
        }
    }
}

/// Result of orchestrating one model turn's function calls.
#[derive(Debug)]
pub enum TurnOutcome {
    /// All calls resolved (or produced no responses).
    Completed(Option<Event>),
    /// At least one call is pending external input. The turn ends
    /// without resolving it; `requests` carries the synthetic
    /// long-running request events to emit after `response`.
    Suspended {
        response: Event,
        requests: Vec<Event>,
    },
}

/// Call ids in `calls` whose tools are long-running.
pub fn get_long_running_call_ids(
    calls: &[FunctionCall],
    registry: &ToolRegistry,
) -> HashSet<String> {
    calls
        .iter()
        .filter(|call| {
            registry
                .get(&call.name)
                .map(|tool| tool.is_long_running())
                .unwrap_or(false)
        })
        .map(|call| call.id.clone())
        .collect()
}

/// Orchestrates the function calls of one model-turn event and decides
/// whether the turn completes or suspends.
pub async fn run_turn(
    turn: &TurnContext,
    model_event: &Event,
    registry: &ToolRegistry,
) -> Result<TurnOutcome> {
    let Some(response) = handle_function_calls(turn, model_event, registry, None).await? else {
        return Ok(TurnOutcome::Completed(None));
    };

    let mut requests = Vec::new();
    if !response.actions.requested_auth_configs.is_empty() {
        requests.push(build_auth_request_event(
            turn,
            &response.actions.requested_auth_configs,
        ));
    }
    if let Some(confirmation_event) =
        generate_confirmation_event(turn, model_event, &response)
    {
        requests.push(confirmation_event);
    }

    if requests.is_empty() {
        Ok(TurnOutcome::Completed(Some(response)))
    } else {
        Ok(TurnOutcome::Suspended { response, requests })
    }
}

/// Executes the (optionally filtered) function calls of an event
/// concurrently and merges the responses into one event.
///
/// A failure in one call does not cancel its siblings: every task runs
/// to completion, then the first error in call order is surfaced.
pub async fn handle_function_calls(
    turn: &TurnContext,
    function_call_event: &Event,
    registry: &ToolRegistry,
    filter: Option<&HashSet<String>>,
) -> Result<Option<Event>> {
    let calls: Vec<FunctionCall> = function_call_event
        .function_calls()
        .into_iter()
        .filter(|call| filter.map(|ids| ids.contains(&call.id)).unwrap_or(true))
        .collect();
    if calls.is_empty() {
        return Ok(None);
    }

    let results = join_all(
        calls
            .iter()
            .map(|call| execute_single_call(turn, call, registry)),
    )
    .await;

    collect_and_merge(results)
}

/// Live variant: handles the `stop_streaming` control call and runs
/// streaming tools as background tasks feeding the live request queue.
pub async fn handle_function_calls_live(
    turn: &TurnContext,
    function_call_event: &Event,
    registry: &ToolRegistry,
) -> Result<Option<Event>> {
    let calls = function_call_event.function_calls();
    if calls.is_empty() {
        return Ok(None);
    }

    let results = join_all(
        calls
            .iter()
            .map(|call| execute_single_call_live(turn, call, registry)),
    )
    .await;

    collect_and_merge(results)
}

fn collect_and_merge(results: Vec<Result<Option<Event>>>) -> Result<Option<Event>> {
    let mut response_events = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(Some(event)) => response_events.push(event),
            Ok(None) => {}
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if response_events.is_empty() {
        return Ok(None);
    }
    Ok(Some(merge_parallel_function_response_events(
        response_events,
    )))
}

async fn execute_single_call(
    turn: &TurnContext,
    call: &FunctionCall,
    registry: &ToolRegistry,
) -> Result<Option<Event>> {
    let mut ctx = ToolContext::new(turn.invocation_id.clone(), call.id.clone());

    let Some(tool) = registry.get(&call.name).cloned() else {
        return handle_unknown_tool(turn, call, &mut ctx).await;
    };

    run_tool_with_interceptors(turn, tool, call, &mut ctx).await
}

async fn execute_single_call_live(
    turn: &TurnContext,
    call: &FunctionCall,
    registry: &ToolRegistry,
) -> Result<Option<Event>> {
    let mut ctx = ToolContext::new(turn.invocation_id.clone(), call.id.clone());

    // Reserved control call: cancel a named streaming tool.
    if call.name == STOP_STREAMING_CALL_NAME {
        let Some(function_name) = call.args.get("function_name").and_then(Value::as_str) else {
            return Err(RuntimeError::validation(
                "stop_streaming requires a function_name argument",
            ));
        };
        let status = turn.streaming.stop(function_name).await;
        let response = json!({"status": status.message(function_name)});
        debug!(function_name, cancelled = ?(status == StopStatus::Stopped), "stop_streaming handled");
        return Ok(Some(build_response_event(turn, &call.name, response, ctx)));
    }

    let Some(tool) = registry.get(&call.name).cloned() else {
        return handle_unknown_tool(turn, call, &mut ctx).await;
    };

    if tool.kind() == ToolKind::Streaming {
        let response = start_streaming_tool(turn, &tool, call).await;
        let response = match turn
            .interceptors
            .run_after(tool.as_ref(), &call.args, &mut ctx, &response)
            .await
        {
            Some(replacement) => replacement,
            None => response,
        };
        return Ok(Some(build_response_event(turn, &call.name, response, ctx)));
    }

    run_tool_with_interceptors(turn, tool, call, &mut ctx).await
}

/// Spawns the streaming tool as a background task pushing its yields
/// into the live request queue, registers it (fresh input channel on
/// every invocation), and returns the pending status expected by the
/// live model.
async fn start_streaming_tool(
    turn: &TurnContext,
    tool: &Arc<dyn Tool>,
    call: &FunctionCall,
) -> Value {
    use futures::StreamExt;

    let (input_tx, input_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut stream = tool.stream(call.args.clone(), input_rx);
    let live_queue = turn.live_queue.clone();
    let tool_name = tool.name().to_string();

    let task = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            if let Some(queue) = &live_queue {
                queue.send_text(format!("Function {tool_name} returned: {result}"));
            }
        }
    });

    turn.streaming.register(tool.name(), task, input_tx).await;

    json!({
        "status": "The function is running asynchronously and the results are pending."
    })
}

async fn handle_unknown_tool(
    turn: &TurnContext,
    call: &FunctionCall,
    ctx: &mut ToolContext,
) -> Result<Option<Event>> {
    let not_found = NotFoundTool::new(call.name.clone());
    let err = RuntimeError::integrity(format!(
        "tool '{}' not found in registry",
        call.name
    ));
    // Routed through the same error chain as real tools so a
    // caller-supplied fallback can still answer the call.
    match turn
        .interceptors
        .run_on_error(&not_found, &call.args, ctx, &err)
        .await
    {
        Some(fallback) => Ok(Some(build_response_event(
            turn,
            &call.name,
            fallback,
            ctx.clone(),
        ))),
        None => {
            error!(tool_name = %call.name, "unknown tool with no fallback, aborting turn");
            Err(err)
        }
    }
}

async fn run_tool_with_interceptors(
    turn: &TurnContext,
    tool: Arc<dyn Tool>,
    call: &FunctionCall,
    ctx: &mut ToolContext,
) -> Result<Option<Event>> {
    // Before chain: first non-None result short-circuits execution.
    let mut response = turn
        .interceptors
        .run_before(tool.as_ref(), &call.args, ctx)
        .await;

    if response.is_none() {
        match execute_tool(turn, &tool, call, ctx).await {
            Ok(value) => response = Some(value),
            Err(err) => {
                match turn
                    .interceptors
                    .run_on_error(tool.as_ref(), &call.args, ctx, &err)
                    .await
                {
                    Some(fallback) => response = Some(fallback),
                    None => return Err(err),
                }
            }
        }
    }

    let response = response.unwrap_or(Value::Null);

    // After chain: first non-None result replaces the tool's result.
    let response = match turn
        .interceptors
        .run_after(tool.as_ref(), &call.args, ctx, &response)
        .await
    {
        Some(replacement) => replacement,
        None => response,
    };

    // A long-running call with no payload contributes no
    // function-response part this turn. Pending auth/confirmation
    // requests it collected must still reach the merged event, so
    // those ride on a part-less event.
    if tool.is_long_running() && response.is_null() {
        if ctx.actions.requested_auth_configs.is_empty()
            && ctx.actions.requested_tool_confirmations.is_empty()
        {
            return Ok(None);
        }
        let mut event = Event::new(turn.invocation_id.clone(), turn.agent_name.clone());
        event.branch = turn.branch.clone();
        event.actions = ctx.actions.clone();
        return Ok(Some(event));
    }

    Ok(Some(build_response_event(
        turn,
        &call.name,
        response,
        ctx.clone(),
    )))
}

async fn execute_tool(
    turn: &TurnContext,
    tool: &Arc<dyn Tool>,
    call: &FunctionCall,
    ctx: &mut ToolContext,
) -> Result<Value> {
    match (tool.kind(), &turn.pool_provider, &turn.pool_config) {
        (ToolKind::Blocking, Some(provider), config) => {
            let size = config
                .as_ref()
                .map(|c| c.max_workers)
                .unwrap_or(crate::pool::DEFAULT_POOL_SIZE);
            let pool = provider.pool(size);
            let tool = Arc::clone(tool);
            let args = call.args.clone();
            pool.run_blocking(move || tool.run_blocking(args)).await?
        }
        _ => tool.run(call.args.clone(), ctx).await,
    }
}

/// Builds the function-response event for one resolved call.
fn build_response_event(
    turn: &TurnContext,
    tool_name: &str,
    result: Value,
    ctx: ToolContext,
) -> Event {
    // The response payload is always an object.
    let response = match result {
        Value::Object(_) => result,
        other => json!({"result": other}),
    };

    let mut event = Event::new(turn.invocation_id.clone(), turn.agent_name.clone());
    event.branch = turn.branch.clone();
    event.content.push(Part::FunctionResponse {
        id: ctx.function_call_id.clone(),
        name: tool_name.to_string(),
        response,
    });
    event.actions = ctx.actions;
    event
}

/// Merges the response events of N parallel calls into one event:
/// parts concatenated in original call order, actions deep-merged with
/// later-wins on leaf conflicts, timestamp taken from the first call.
pub fn merge_parallel_function_response_events(mut events: Vec<Event>) -> Event {
    if events.len() == 1 {
        return events.remove(0);
    }

    let base = &events[0];
    let mut merged = Event::new(base.invocation_id.clone(), base.author.clone());
    merged.branch = base.branch.clone();
    merged.timestamp = base.timestamp;

    for event in &events {
        merged.content.extend(event.content.iter().cloned());
        merged.actions.merge(&event.actions);
        merged
            .long_running_ids
            .extend(event.long_running_ids.iter().cloned());
    }
    merged
}

/// Generates the confirmation request event for a response event whose
/// calls asked for caller confirmation, pairing each request with its
/// original function call.
pub fn generate_confirmation_event(
    turn: &TurnContext,
    function_call_event: &Event,
    response_event: &Event,
) -> Option<Event> {
    if response_event
        .actions
        .requested_tool_confirmations
        .is_empty()
    {
        return None;
    }

    let original_calls = function_call_event.function_calls();
    let mut event = Event::new(turn.invocation_id.clone(), turn.agent_name.clone());
    event.branch = turn.branch.clone();

    // Original call order, so multi-call confirmation events are stable.
    for original in &original_calls {
        let Some(confirmation) = response_event
            .actions
            .requested_tool_confirmations
            .get(&original.id)
        else {
            continue;
        };
        let synthetic_id = generate_client_call_id();
        event.long_running_ids.insert(synthetic_id.clone());
        event.content.push(Part::FunctionCall {
            id: synthetic_id,
            name: REQUEST_CONFIRMATION_CALL_NAME.to_string(),
            args: json!({
                "original_function_call": {
                    "id": original.id,
                    "name": original.name,
                    "args": original.args,
                },
                "tool_confirmation": confirmation,
            }),
        });
    }

    if event.content.is_empty() {
        None
    } else {
        Some(event)
    }
}
