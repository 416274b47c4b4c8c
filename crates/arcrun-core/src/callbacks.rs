// Tool-call interceptor chains
//
// Two ordered levels run around every tool call: the plugin-level chain
// first, then the agent-level chain. For before/after hooks the first
// non-None result short-circuits the rest; for on-error hooks the first
// non-None result becomes the fallback response.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RuntimeError;
use crate::tools::{Tool, ToolContext};

/// Hooks that run around tool execution.
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    /// Runs before the tool. A non-None result replaces execution
    /// entirely.
    async fn before_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
    ) -> Option<Value> {
        None
    }

    /// Runs after the tool. A non-None result replaces the tool's
    /// result.
    async fn after_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
        _result: &Value,
    ) -> Option<Value> {
        None
    }

    /// Runs when the tool (or its resolution) failed. A non-None result
    /// becomes the fallback response; otherwise the error propagates.
    async fn on_tool_error(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
        _error: &RuntimeError,
    ) -> Option<Value> {
        None
    }
}

/// The plugin-level and agent-level interceptor lists, in precedence
/// order.
#[derive(Default, Clone)]
pub struct InterceptorChains {
    pub plugin: Vec<Arc<dyn ToolInterceptor>>,
    pub agent: Vec<Arc<dyn ToolInterceptor>>,
}

impl InterceptorChains {
    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn ToolInterceptor>> {
        self.plugin.iter().chain(self.agent.iter())
    }

    pub async fn run_before(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
    ) -> Option<Value> {
        for interceptor in self.ordered() {
            if let Some(response) = interceptor.before_tool(tool, args, ctx).await {
                return Some(response);
            }
        }
        None
    }

    pub async fn run_after(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
        result: &Value,
    ) -> Option<Value> {
        for interceptor in self.ordered() {
            if let Some(response) = interceptor.after_tool(tool, args, ctx, result).await {
                return Some(response);
            }
        }
        None
    }

    pub async fn run_on_error(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
        error: &RuntimeError,
    ) -> Option<Value> {
        for interceptor in self.ordered() {
            if let Some(response) = interceptor.on_tool_error(tool, args, ctx, error).await {
                return Some(response);
            }
        }
        None
    }
}

impl std::fmt::Debug for InterceptorChains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChains")
            .field("plugin", &self.plugin.len())
            .field("agent", &self.agent.len())
            .finish()
    }
}
