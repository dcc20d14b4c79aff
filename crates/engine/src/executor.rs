//! Node executor registry.
//!
//! Every ready node is handed to the strategy for its kind:
//! - [`AutoExecutor`] resolves the node's tool and returns it for the task
//!   engine to spawn.
//! - [`HumanExecutor`] picks the assignee and the AI hint; the node then
//!   waits in persisted state until someone submits a decision.
//!
//! Neither strategy touches the database; the task engine records the
//! resulting steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use nodes::builtin::FailTool;
use nodes::{SuggestionContext, SuggestionProvider, Tool, ToolRegistry};

use crate::error::EngineError;
use crate::models::{AutoConfig, HumanConfig, NodeKind, NodeSpec};

/// Everything a strategy may need to know about the task a node runs in.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub flow_id: i64,
    pub flow_name: String,
    pub task_id: i64,
    /// User who triggered the task, if any.
    pub triggered_by: Option<String>,
    /// Outputs of the node's predecessors, keyed by node ID.
    pub upstream: Map<String, Value>,
}

/// A tool invocation ready to be spawned.
#[derive(Clone)]
pub struct ToolLaunch {
    pub tool_name: String,
    pub tool: Arc<dyn Tool>,
    pub params: Value,
}

/// Assignment of a human step.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanAssignment {
    pub assigned_to: String,
    pub ai_suggestion: Option<String>,
    pub instructions: String,
}

/// What the task engine has to do for a ready node.
pub enum Launch {
    Invoke(ToolLaunch),
    AwaitHuman(HumanAssignment),
}

/// Strategy for one node kind.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn launch(&self, node: &NodeSpec, ctx: &LaunchContext) -> Result<Launch, EngineError>;
}

// ---------------------------------------------------------------------------
// Auto
// ---------------------------------------------------------------------------

pub struct AutoExecutor {
    tools: ToolRegistry,
}

impl AutoExecutor {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn resolve(&self, node: &NodeSpec, cfg: &AutoConfig) -> Result<ToolLaunch, EngineError> {
        if cfg.should_fail {
            return Ok(ToolLaunch {
                tool_name: "fail".into(),
                tool: Arc::new(FailTool),
                params: Value::Null,
            });
        }
        let tool = self.tools.get(&cfg.tool).ok_or_else(|| EngineError::UnknownTool {
            node_id: node.id.clone(),
            tool: cfg.tool.clone(),
        })?;
        Ok(ToolLaunch { tool_name: cfg.tool.clone(), tool, params: cfg.invocation_params() })
    }
}

#[async_trait]
impl NodeExecutor for AutoExecutor {
    async fn launch(&self, node: &NodeSpec, _ctx: &LaunchContext) -> Result<Launch, EngineError> {
        match &node.kind {
            NodeKind::Auto(cfg) => self.resolve(node, cfg).map(Launch::Invoke),
            NodeKind::Human(_) => Err(EngineError::Corrupt(format!(
                "node '{}' is not automatic",
                node.id
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Human
// ---------------------------------------------------------------------------

/// Maps a node's `role` to a concrete user.
pub trait AssigneeResolver: Send + Sync {
    fn resolve_role(&self, role: &str) -> Option<String>;
}

/// Fixed role → user table.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    roles: HashMap<String, String>,
}

impl RoleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: impl Into<String>, user: impl Into<String>) -> Self {
        self.roles.insert(role.into(), user.into());
        self
    }
}

impl AssigneeResolver for RoleMap {
    fn resolve_role(&self, role: &str) -> Option<String> {
        self.roles.get(role).cloned()
    }
}

pub struct HumanExecutor {
    suggestions: Arc<dyn SuggestionProvider>,
    resolver: Arc<dyn AssigneeResolver>,
    default_assignee: String,
    suggestion_timeout: Duration,
}

impl HumanExecutor {
    pub fn new(
        suggestions: Arc<dyn SuggestionProvider>,
        resolver: Arc<dyn AssigneeResolver>,
        default_assignee: impl Into<String>,
    ) -> Self {
        Self {
            suggestions,
            resolver,
            default_assignee: default_assignee.into(),
            suggestion_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_suggestion_timeout(mut self, timeout: Duration) -> Self {
        self.suggestion_timeout = timeout;
        self
    }

    /// Explicit assignee, then the role's user, then whoever triggered the
    /// task, then the configured default.
    fn assignee(&self, cfg: &HumanConfig, ctx: &LaunchContext) -> String {
        cfg.assignee
            .clone()
            .or_else(|| cfg.role.as_deref().and_then(|r| self.resolver.resolve_role(r)))
            .or_else(|| ctx.triggered_by.clone())
            .unwrap_or_else(|| self.default_assignee.clone())
    }

    async fn suggestion(&self, node: &NodeSpec, cfg: &HumanConfig, ctx: &LaunchContext) -> Option<String> {
        if let Some(s) = cfg.ai_suggestion.as_ref().filter(|s| !s.is_empty()) {
            return Some(s.clone());
        }
        let request = SuggestionContext {
            flow_name: ctx.flow_name.clone(),
            task_id: ctx.task_id,
            node_id: node.id.clone(),
            label: node.label.clone(),
            instructions: cfg.instructions.clone(),
            upstream: ctx.upstream.clone(),
        };
        match tokio::time::timeout(self.suggestion_timeout, self.suggestions.suggest(&request)).await {
            Ok(suggestion) => suggestion,
            Err(_) => {
                warn!(task_id = ctx.task_id, node = %node.id, "no suggestion within {:?}", self.suggestion_timeout);
                None
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for HumanExecutor {
    async fn launch(&self, node: &NodeSpec, ctx: &LaunchContext) -> Result<Launch, EngineError> {
        let NodeKind::Human(cfg) = &node.kind else {
            return Err(EngineError::Corrupt(format!("node '{}' is not a human step", node.id)));
        };
        let assignment = HumanAssignment {
            assigned_to: self.assignee(cfg, ctx),
            ai_suggestion: self.suggestion(node, cfg, ctx).await,
            instructions: cfg.instructions.clone(),
        };
        debug!(node = %node.id, assignee = %assignment.assigned_to, "human step assigned");
        Ok(Launch::AwaitHuman(assignment))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Dispatches a node to the strategy for its kind.
pub struct ExecutorRegistry {
    auto: AutoExecutor,
    human: HumanExecutor,
}

impl ExecutorRegistry {
    pub fn new(auto: AutoExecutor, human: HumanExecutor) -> Self {
        Self { auto, human }
    }

    pub fn executor_for(&self, node: &NodeSpec) -> &dyn NodeExecutor {
        match node.kind {
            NodeKind::Auto(_) => &self.auto,
            NodeKind::Human(_) => &self.human,
        }
    }

    pub async fn launch(&self, node: &NodeSpec, ctx: &LaunchContext) -> Result<Launch, EngineError> {
        self.executor_for(node).launch(node, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::mock::{MockSuggestions, MockTool};
    use nodes::NoSuggestions;
    use serde_json::json;

    fn ctx(triggered_by: Option<&str>) -> LaunchContext {
        LaunchContext {
            flow_id: 1,
            flow_name: "Invoices".into(),
            task_id: 9,
            triggered_by: triggered_by.map(str::to_owned),
            upstream: Map::new(),
        }
    }

    fn registry(suggestions: Arc<dyn SuggestionProvider>, roles: RoleMap) -> ExecutorRegistry {
        let mut tools = ToolRegistry::new();
        tools.register("lookup", Arc::new(MockTool::returning(json!({ "ok": true }))));
        ExecutorRegistry::new(
            AutoExecutor::new(tools),
            HumanExecutor::new(suggestions, Arc::new(roles), "manager"),
        )
    }

    #[tokio::test]
    async fn auto_node_resolves_its_tool() {
        let reg = registry(Arc::new(NoSuggestions), RoleMap::new());
        let node = NodeSpec::auto(
            "a",
            "Lookup",
            AutoConfig { tool: "lookup".into(), params: json!({ "id": 3 }), ..AutoConfig::default() },
        );
        match reg.launch(&node, &ctx(None)).await.unwrap() {
            Launch::Invoke(launch) => {
                assert_eq!(launch.tool_name, "lookup");
                assert_eq!(launch.params, json!({ "id": 3 }));
            }
            Launch::AwaitHuman(_) => panic!("expected a tool launch"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let reg = registry(Arc::new(NoSuggestions), RoleMap::new());
        let node = NodeSpec::auto(
            "a",
            "Mystery",
            AutoConfig { tool: "teleport".into(), ..AutoConfig::default() },
        );
        let err = reg.launch(&node, &ctx(None)).await.err().unwrap();
        assert!(matches!(err, EngineError::UnknownTool { tool, .. } if tool == "teleport"));
    }

    #[tokio::test]
    async fn should_fail_swaps_in_the_fail_tool() {
        let reg = registry(Arc::new(NoSuggestions), RoleMap::new());
        let node = NodeSpec::auto(
            "a",
            "Broken",
            AutoConfig { tool: "teleport".into(), should_fail: true, ..AutoConfig::default() },
        );
        assert!(matches!(
            reg.launch(&node, &ctx(None)).await.unwrap(),
            Launch::Invoke(ToolLaunch { ref tool_name, .. }) if tool_name == "fail"
        ));
    }

    #[tokio::test]
    async fn human_assignee_precedence() {
        let reg = registry(Arc::new(NoSuggestions), RoleMap::new().with("finance", "fiona"));

        let explicit = NodeSpec::human(
            "h",
            "Sign",
            HumanConfig {
                assignee: Some("alice".into()),
                role: Some("finance".into()),
                ..HumanConfig::default()
            },
        );
        let by_role = NodeSpec::human(
            "h",
            "Sign",
            HumanConfig { role: Some("finance".into()), ..HumanConfig::default() },
        );
        let unassigned = NodeSpec::human("h", "Sign", HumanConfig::default());

        let assignee = |launch: Launch| match launch {
            Launch::AwaitHuman(a) => a.assigned_to,
            Launch::Invoke(_) => panic!("expected a human step"),
        };

        assert_eq!(assignee(reg.launch(&explicit, &ctx(Some("bob"))).await.unwrap()), "alice");
        assert_eq!(assignee(reg.launch(&by_role, &ctx(Some("bob"))).await.unwrap()), "fiona");
        assert_eq!(assignee(reg.launch(&unassigned, &ctx(Some("bob"))).await.unwrap()), "bob");
        assert_eq!(assignee(reg.launch(&unassigned, &ctx(None)).await.unwrap()), "manager");
    }

    #[tokio::test]
    async fn configured_suggestion_wins_over_provider() {
        let provider = Arc::new(MockSuggestions::answering("from provider"));
        let reg = registry(provider.clone(), RoleMap::new());

        let fixed = NodeSpec::human(
            "h1",
            "Draft reply",
            HumanConfig { ai_suggestion: Some("fixed text".into()), ..HumanConfig::default() },
        );
        let open = NodeSpec::human("h2", "Summarise", HumanConfig::default());

        let suggestion = |launch: Launch| match launch {
            Launch::AwaitHuman(a) => a.ai_suggestion,
            Launch::Invoke(_) => panic!("expected a human step"),
        };

        assert_eq!(suggestion(reg.launch(&fixed, &ctx(None)).await.unwrap()).as_deref(), Some("fixed text"));
        assert_eq!(suggestion(reg.launch(&open, &ctx(None)).await.unwrap()).as_deref(), Some("from provider"));
        assert_eq!(*provider.asked.lock().unwrap(), vec!["Summarise".to_string()]);
    }

    struct SlowSuggestions;

    #[async_trait]
    impl SuggestionProvider for SlowSuggestions {
        async fn suggest(&self, _ctx: &SuggestionContext) -> Option<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Some("too late".into())
        }
    }

    #[tokio::test]
    async fn slow_provider_leaves_the_step_without_a_hint() {
        let human = HumanExecutor::new(Arc::new(SlowSuggestions), Arc::new(RoleMap::new()), "manager")
            .with_suggestion_timeout(Duration::from_millis(20));
        let node = NodeSpec::human("h", "Summarise", HumanConfig::default());

        match human.launch(&node, &ctx(Some("bob"))).await.unwrap() {
            Launch::AwaitHuman(a) => {
                assert_eq!(a.assigned_to, "bob");
                assert!(a.ai_suggestion.is_none());
            }
            Launch::Invoke(_) => panic!("expected a human step"),
        }
    }
}
