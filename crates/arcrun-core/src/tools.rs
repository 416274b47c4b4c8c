// Tool abstraction for the invocation runtime
//
// Tools are defined via the `Tool` trait and registered with a
// `ToolRegistry` (name -> tool). Capability is an explicit tag assigned
// at construction time rather than runtime introspection: `Async` tools
// run on the cooperative scheduler, `Blocking` tools are isolated in a
// bounded worker pool, `Streaming` tools are async generators driven by
// a live input channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::actions::{EventActions, ToolConfirmation};
use crate::auth::AuthConfig;
use crate::error::{Result, RuntimeError};
use crate::live::LiveInputReceiver;

/// Execution capability of a tool, fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Ordinary async tool, runs on the cooperative scheduler.
    Async,
    /// Tool with a blocking body, runs inside the worker pool.
    Blocking,
    /// Async generator fed by the live input channel.
    Streaming,
}

/// Per-call runtime context handed to a tool.
///
/// Side effects a tool wants (state deltas, auth requests,
/// confirmation requests) are collected here and carried on the
/// resulting function-response event; they are applied when the session
/// service processes that event, never directly.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub invocation_id: String,
    pub function_call_id: String,
    pub actions: EventActions,
    pub tool_confirmation: Option<ToolConfirmation>,
}

impl ToolContext {
    pub fn new(invocation_id: impl Into<String>, function_call_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            function_call_id: function_call_id.into(),
            actions: EventActions::default(),
            tool_confirmation: None,
        }
    }

    /// Suspends this call pending an external credential exchange.
    pub fn request_credential(&mut self, auth_config: AuthConfig) {
        self.actions
            .requested_auth_configs
            .insert(self.function_call_id.clone(), auth_config);
    }

    /// Suspends this call pending caller confirmation.
    pub fn request_confirmation(&mut self, confirmation: ToolConfirmation) {
        self.actions
            .requested_tool_confirmations
            .insert(self.function_call_id.clone(), confirmation);
    }
}

/// Trait for tools executable by the orchestrator.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique name within a registry.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Execution capability tag.
    fn kind(&self) -> ToolKind {
        ToolKind::Async
    }

    /// Long-running tools may return `Value::Null` to contribute no
    /// function-response part this turn.
    fn is_long_running(&self) -> bool {
        false
    }

    /// Execute the tool. Errors are routed through the on-error
    /// interceptor chain; unhandled errors abort the turn.
    async fn run(&self, args: Value, ctx: &mut ToolContext) -> Result<Value>;

    /// Blocking entry point, required for `ToolKind::Blocking` tools.
    /// Runs on a worker thread, so it may block freely.
    fn run_blocking(&self, _args: Value) -> Result<Value> {
        Err(RuntimeError::tool(format!(
            "tool '{}' has no blocking entry point",
            self.name()
        )))
    }

    /// Streaming entry point, required for `ToolKind::Streaming` tools.
    /// Yields intermediate results; `input` delivers live input sent by
    /// the caller while the stream runs.
    fn stream(&self, _args: Value, _input: LiveInputReceiver) -> BoxStream<'static, Value> {
        Box::pin(futures::stream::empty())
    }
}

/// A registry that maps tool names to tools for one agent.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

/// Stand-in for a call whose tool name is not in the registry. It is
/// routed through the same interceptor chain as real tools so a
/// caller-supplied fallback can still answer the call.
pub struct NotFoundTool {
    name: String,
}

impl NotFoundTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for NotFoundTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Tool not found"
    }

    async fn run(&self, _args: Value, _ctx: &mut ToolContext) -> Result<Value> {
        Err(RuntimeError::integrity(format!(
            "tool '{}' not found in registry",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, args: Value, _ctx: &mut ToolContext) -> Result<Value> {
            Ok(json!({"echoed": args.get("message").cloned().unwrap_or(Value::Null)}))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        assert!(registry.has("echo"));
        assert!(!registry.has("missing"));
        assert_eq!(registry.len(), 1);

        let tool = registry.get("echo").unwrap();
        let mut ctx = ToolContext::new("inv1", "call_1");
        let result = tool.run(json!({"message": "hi"}), &mut ctx).await.unwrap();
        assert_eq!(result["echoed"], "hi");
    }

    #[tokio::test]
    async fn test_request_credential_keys_by_call_id() {
        let mut ctx = ToolContext::new("inv1", "call_7");
        ctx.request_credential(AuthConfig::new(json!({"type": "oauth2"})));
        assert!(ctx.actions.requested_auth_configs.contains_key("call_7"));
    }

    #[tokio::test]
    async fn test_not_found_tool_raises_integrity() {
        let tool = NotFoundTool::new("ghost");
        let mut ctx = ToolContext::new("inv1", "call_1");
        let err = tool.run(json!({}), &mut ctx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Integrity(_)));
    }
}
