//! The capabilities the engine delegates to: [`Tool`] for automatic nodes and
//! [`SuggestionProvider`] for the AI hint shown on human nodes.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::ToolError;

/// Context handed to a tool invocation.
///
/// Defined here (in the nodes crate) so both the engine and individual tool
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContext {
    pub flow_id: i64,
    pub task_id: i64,
    pub step_id: i64,
    /// Node id within the task's bound flow version.
    pub node_id: String,
    pub label: String,
}

/// The pluggable action behind an automatic node.
///
/// Implementations may block for as long as they need: the engine runs each
/// invocation on its own tokio task and treats completion as an event.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Run the action with the node's configured `params` and return the
    /// step output.
    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Everything a suggestion provider may look at for a human step.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionContext {
    pub flow_name: String,
    pub task_id: i64,
    pub node_id: String,
    pub label: String,
    pub instructions: String,
    /// Outputs of the node's direct predecessors, keyed by node id.
    pub upstream: serde_json::Map<String, Value>,
}

/// Opaque source of AI suggestions for human steps.
#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    async fn suggest(&self, ctx: &SuggestionContext) -> Option<String>;
}

/// Provider used when no suggestion backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionProvider for NoSuggestions {
    async fn suggest(&self, _ctx: &SuggestionContext) -> Option<String> {
        None
    }
}
