//! Built-in tools and the name → tool registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Tool, ToolContext, ToolError};

/// Tool name used by automatic nodes that do not name one.
pub const DEFAULT_TOOL: &str = "echo";

/// Maps tool names (the `tool` field of an auto node's config) to
/// implementations.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `echo`, `fail` and `sleep`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoTool));
        registry.register("fail", Arc::new(FailTool));
        registry.register("sleep", Arc::new(SleepTool));
        registry
    }

    /// Register (or replace) a tool under `name`.
    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(name.into(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Returns its parameters, tagged with the node label.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        debug!(node = %ctx.node_id, "echo tool invoked");
        Ok(json!({ "node": ctx.label, "params": params }))
    }
}

/// Always fails; `params.message` overrides the error text.
pub struct FailTool;

#[async_trait]
impl Tool for FailTool {
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("node '{}' is configured to fail", ctx.label));
        Err(ToolError::Failed(message))
    }
}

/// Waits `params.ms` milliseconds (at most one minute), then echoes.
pub struct SleepTool;

const MAX_SLEEP_MS: u64 = 60_000;

#[async_trait]
impl Tool for SleepTool {
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let ms = match params.get("ms") {
            None => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ToolError::InvalidParams("`ms` must be a non-negative integer".into()))?,
        };
        tokio::time::sleep(Duration::from_millis(ms.min(MAX_SLEEP_MS))).await;
        Ok(json!({ "node": ctx.label, "slept_ms": ms.min(MAX_SLEEP_MS) }))
    }
}
