//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a flow looks like in
//! memory. Node and edge lists are stored as JSON in `flow_versions`; the
//! row structs of the `db` crate are converted into the typed values here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use db::models::{FlowRow, FlowVersionRow, NotificationRow, StepRow, TaskRow};
use nodes::DEFAULT_TOOL;

use crate::error::{EngineError, FlowValidationError};

/// Implements `as_str`, `Display` and `FromStr` for a unit-only enum whose
/// wire names are listed explicitly.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::Corrupt(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How tasks of a flow are started besides the manual trigger endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Only started on demand.
    #[default]
    Manual,
    /// Started by the scheduler from the 5-field expression in
    /// `trigger_config`.
    Cron,
    /// Scheduling disabled.
    None,
}

string_enum!(TriggerType { Manual => "manual", Cron => "cron", None => "none" });

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Configuration of an automatic node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoConfig {
    /// Registered tool name.
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    /// Forces the node to fail without calling its tool.
    #[serde(default)]
    pub should_fail: bool,
    /// Editor fields the engine does not interpret (`url`, `method`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_tool() -> String {
    DEFAULT_TOOL.to_string()
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            params: Value::Null,
            should_fail: false,
            extra: Map::new(),
        }
    }
}

impl AutoConfig {
    /// Parameters handed to the tool: `params`, or the uninterpreted editor
    /// fields when no `params` were given.
    pub fn invocation_params(&self) -> Value {
        match &self.params {
            Value::Null if !self.extra.is_empty() => Value::Object(self.extra.clone()),
            Value::String(s) if s.is_empty() && !self.extra.is_empty() => {
                Value::Object(self.extra.clone())
            }
            other => other.clone(),
        }
    }
}

/// Configuration of a human node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanConfig {
    #[serde(default)]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a node does when it becomes ready.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    Auto(AutoConfig),
    Human(HumanConfig),
}

impl NodeKind {
    pub fn tag(&self) -> StepKind {
        match self {
            NodeKind::Auto(_) => StepKind::Auto,
            NodeKind::Human(_) => StepKind::Human,
        }
    }
}

/// A single node of a flow graph.
///
/// Serialises to the flat shape `{id, label, kind, config}`; deserialises
/// from either that shape or the editor shape
/// `{id, type, data: {label, nodeType, config, should_fail}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireNode")]
pub struct NodeSpec {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Editor canvas position, kept so layouts survive a round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

impl NodeSpec {
    pub fn auto(id: impl Into<String>, label: impl Into<String>, config: AutoConfig) -> Self {
        Self { id: id.into(), label: label.into(), kind: NodeKind::Auto(config), position: None }
    }

    pub fn human(id: impl Into<String>, label: impl Into<String>, config: HumanConfig) -> Self {
        Self { id: id.into(), label: label.into(), kind: NodeKind::Human(config), position: None }
    }

    pub fn is_human(&self) -> bool {
        matches!(self.kind, NodeKind::Human(_))
    }

    /// The node without layout-only data, for structural comparison.
    pub fn without_layout(&self) -> Self {
        Self { position: None, ..self.clone() }
    }
}

#[derive(Deserialize)]
struct WireNode {
    id: String,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    data: Option<WireNodeData>,
    #[serde(default)]
    should_fail: bool,
    #[serde(default)]
    position: Option<Value>,
}

#[derive(Deserialize, Default)]
struct WireNodeData {
    #[serde(default)]
    label: Option<String>,
    #[serde(default, rename = "nodeType", alias = "node_type", alias = "kind")]
    node_type: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    should_fail: bool,
}

impl TryFrom<WireNode> for NodeSpec {
    type Error = String;

    fn try_from(wire: WireNode) -> Result<Self, Self::Error> {
        let data = wire.data.unwrap_or_default();
        let kind = data
            .node_type
            .or(wire.kind)
            .ok_or_else(|| format!("node '{}' has no kind", wire.id))?;
        let label = data.label.or(wire.label).unwrap_or_else(|| wire.id.clone());
        let config = match data.config.or(wire.config) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v,
        };
        let should_fail = wire.should_fail || data.should_fail;

        let kind = match kind.as_str() {
            "auto" => {
                let mut cfg: AutoConfig = serde_json::from_value(config)
                    .map_err(|e| format!("node '{}': invalid auto config: {e}", wire.id))?;
                cfg.should_fail |= should_fail;
                NodeKind::Auto(cfg)
            }
            "human" => NodeKind::Human(
                serde_json::from_value(config)
                    .map_err(|e| format!("node '{}': invalid human config: {e}", wire.id))?,
            ),
            other => return Err(format!("node '{}' has unknown kind '{other}'", wire.id)),
        };

        Ok(NodeSpec { id: wire.id, label, kind, position: wire.position })
    }
}

// ---------------------------------------------------------------------------
// Edges / definitions
// ---------------------------------------------------------------------------

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(alias = "source_node_id")]
    pub source: String,
    #[serde(alias = "target_node_id")]
    pub target: String,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into() }
    }
}

/// The graph content of one flow version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl FlowDefinition {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self { nodes, edges }
    }

    /// Parse node and edge lists in any accepted wire shape.
    pub fn from_json(nodes: &Value, edges: &Value) -> Result<Self, EngineError> {
        let nodes: Vec<NodeSpec> = match nodes {
            Value::Null => Vec::new(),
            v => serde_json::from_value(v.clone())
                .map_err(|e| FlowValidationError::Malformed(e.to_string()))?,
        };
        let edges: Vec<EdgeSpec> = match edges {
            Value::Null => Vec::new(),
            v => serde_json::from_value(v.clone())
                .map_err(|e| FlowValidationError::Malformed(e.to_string()))?,
        };
        Ok(Self { nodes, edges })
    }

    pub fn nodes_json(&self) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(&self.nodes)?)
    }

    pub fn edges_json(&self) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(&self.edges)?)
    }

    pub fn has_human_step(&self) -> bool {
        self.nodes.iter().any(NodeSpec::is_human)
    }
}

// ---------------------------------------------------------------------------
// Flows / versions
// ---------------------------------------------------------------------------

/// Flow header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flow {
    pub id: i64,
    pub name: String,
    pub trigger_type: TriggerType,
    pub trigger_config: Option<String>,
    pub current_version: i64,
    pub last_scheduled_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<FlowRow> for Flow {
    type Error = EngineError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            trigger_type: row.trigger_type.parse()?,
            trigger_config: row.trigger_config,
            current_version: row.current_version,
            last_scheduled_at: row.last_scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A flow together with the graph of its current version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDetail {
    #[serde(flatten)]
    pub flow: Flow,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

/// Values accepted when creating a flow or saving a new version.
#[derive(Debug, Clone, Default)]
pub struct FlowInput {
    pub name: String,
    pub trigger_type: TriggerType,
    pub trigger_config: Option<String>,
    pub definition: FlowDefinition,
}

/// An immutable graph snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Version {
    pub flow_id: i64,
    pub version_no: i64,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn definition(&self) -> FlowDefinition {
        FlowDefinition::new(self.nodes.clone(), self.edges.clone())
    }
}

impl TryFrom<FlowVersionRow> for Version {
    type Error = EngineError;

    fn try_from(row: FlowVersionRow) -> Result<Self, Self::Error> {
        let def = FlowDefinition::from_json(&row.nodes, &row.edges)?;
        Ok(Self {
            flow_id: row.flow_id,
            version_no: row.version_no,
            nodes: def.nodes,
            edges: def.edges,
            created_at: row.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Rejected,
}

string_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

/// One execution of a flow version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: i64,
    pub flow_id: i64,
    pub version_no: i64,
    pub title: String,
    pub flow_name: String,
    pub status: TaskStatus,
    pub has_human_step: bool,
    pub assigned_to: Option<String>,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = EngineError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            flow_id: row.flow_id,
            version_no: row.version_no,
            title: row.title,
            flow_name: row.flow_name,
            status: row.status.parse()?,
            has_human_step: row.has_human_step,
            assigned_to: row.assigned_to,
            reason: row.reason,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

/// What started a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    Manual { actor: String },
    Scheduled,
}

impl TriggerSource {
    pub fn manual(actor: impl Into<String>) -> Self {
        Self::Manual { actor: actor.into() }
    }

    pub(crate) fn title_tag(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub(crate) fn actor(&self) -> Option<String> {
        match self {
            Self::Manual { actor } => Some(actor.clone()),
            Self::Scheduled => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Auto,
    Human,
}

string_enum!(StepKind { Auto => "auto", Human => "human" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Approved,
    Rejected,
    Failed,
}

string_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Approved => "approved",
    Rejected => "rejected",
    Failed => "failed",
});

impl StepStatus {
    /// Successors of a node may start once its step reaches one of these.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Outcome of a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[serde(alias = "accept", alias = "approve")]
    Approved,
    #[serde(alias = "modify")]
    Modified,
    #[serde(alias = "reject")]
    Rejected,
}

string_enum!(Decision { Approved => "approved", Modified => "modified", Rejected => "rejected" });

/// A human decision on a pending step.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub decision: Decision,
    pub output: Option<Value>,
    pub reason: Option<String>,
    pub actor: String,
}

/// One node instantiated within a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: i64,
    pub task_id: i64,
    pub node_id: String,
    pub label: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub assigned_to: Option<String>,
    pub decision: Option<Decision>,
    pub output: Option<Value>,
    pub ai_suggestion: Option<String>,
    pub reason: Option<String>,
    pub decided_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for Step {
    type Error = EngineError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            node_id: row.node_id,
            label: row.label,
            kind: row.kind.parse()?,
            status: row.status.parse()?,
            assigned_to: row.assigned_to,
            decision: row.decision.as_deref().map(str::parse).transpose()?,
            output: row.output,
            ai_suggestion: row.ai_suggestion,
            reason: row.reason,
            decided_by: row.decided_by,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    HumanStep,
    Alert,
    Urge,
}

string_enum!(NotificationKind { HumanStep => "human_step", Alert => "alert", Urge => "urge" });

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub task_id: i64,
    pub step_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub target_user: Option<String>,
    pub payload: Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = EngineError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            kind: row.kind.parse()?,
            task_id: row.task_id,
            step_id: row.step_id,
            title: row.title,
            content: row.content,
            target_user: row.target_user,
            payload: row.payload,
            processed: row.processed,
            created_at: row.created_at,
        })
    }
}

/// Convert a batch of rows, failing on the first corrupt one.
pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, EngineError>
where
    T: TryFrom<R, Error = EngineError>,
{
    rows.into_iter().map(T::try_from).collect()
}
