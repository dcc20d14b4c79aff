//! Engine-level error types.

use thiserror::Error;

use crate::models::{StepStatus, TaskStatus};

/// Structural problems found while compiling a flow definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowValidationError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the flow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("flow graph contains a cycle")]
    CycleDetected,

    /// Every node has an incoming edge, so nothing can start.
    #[error("flow has no entry node (every node has an incoming edge)")]
    NoEntryNode,

    /// The flow has no nodes at all.
    #[error("flow has no nodes")]
    EmptyFlow,

    /// A node or edge could not be read.
    #[error("malformed definition: {0}")]
    Malformed(String),
}

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Request validation errors ------

    /// The flow graph is cyclic, dangling or otherwise unusable.
    #[error("invalid flow: {0}")]
    InvalidFlow(#[from] FlowValidationError),

    /// The trigger configuration (e.g. the cron expression) is invalid.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // ------ Lookup errors ------

    #[error("flow {0} not found")]
    FlowNotFound(i64),

    #[error("version {version_no} of flow {flow_id} not found")]
    VersionNotFound { flow_id: i64, version_no: i64 },

    #[error("cannot roll back flow {flow_id}: version {version_no} does not exist")]
    RollbackTargetNotFound { flow_id: i64, version_no: i64 },

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("step {step_id} not found in task {task_id}")]
    StepNotFound { task_id: i64, step_id: i64 },

    #[error("notification {0} not found")]
    NotificationNotFound(i64),

    // ------ State machine errors ------

    /// Stale or duplicate submission.
    #[error("step {step_id} is not awaiting a decision (status: {status})")]
    StepNotPending { step_id: i64, status: StepStatus },

    #[error("task {task_id} is {status} and accepts no further changes")]
    TaskNotActive { task_id: i64, status: TaskStatus },

    #[error("task {task_id} is {status}; proxy handling requires a rejected task")]
    TaskNotRejected { task_id: i64, status: TaskStatus },

    #[error("task {task_id} cannot be urged: {reason}")]
    NotUrgeable { task_id: i64, reason: String },

    // ------ Execution errors ------

    #[error("node '{node_id}' names unregistered tool '{tool}'")]
    UnknownTool { node_id: String, tool: String },

    /// An automatic node failed. Recorded on the step, never returned to
    /// the caller that triggered the task.
    #[error("node '{node_id}' failed: {message}")]
    ToolExecution { node_id: String, message: String },

    /// The per-task worker dropped the reply channel.
    #[error("task worker stopped before replying")]
    EngineUnavailable,

    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFlow(_) => "invalid_flow",
            Self::InvalidTrigger(_) => "invalid_trigger",
            Self::InvalidSubmission(_) => "invalid_submission",
            Self::InvalidQuery(_) => "invalid_query",
            Self::FlowNotFound(_) => "flow_not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::RollbackTargetNotFound { .. } => "rollback_target_not_found",
            Self::TaskNotFound(_) => "task_not_found",
            Self::StepNotFound { .. } => "step_not_found",
            Self::NotificationNotFound(_) => "notification_not_found",
            Self::StepNotPending { .. } => "step_not_pending",
            Self::TaskNotActive { .. } => "task_not_active",
            Self::TaskNotRejected { .. } => "task_not_rejected",
            Self::NotUrgeable { .. } => "not_urgeable",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::ToolExecution { .. } => "tool_execution",
            Self::EngineUnavailable => "engine_unavailable",
            Self::Corrupt(_) => "corrupt",
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
        }
    }
}
