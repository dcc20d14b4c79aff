//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Domain types (statuses, node kinds, …) live in the `engine` crate; here
//! they are plain strings and JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// flows
// ---------------------------------------------------------------------------

/// A persisted flow header row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowRow {
    pub id: i64,
    pub name: String,
    /// `manual` | `cron` | `none`
    pub trigger_type: String,
    pub trigger_config: Option<String>,
    pub current_version: i64,
    /// Unix seconds of the last cron minute claimed by the scheduler.
    pub last_scheduled_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for inserting a flow together with its first version.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub trigger_type: String,
    pub trigger_config: Option<String>,
    pub nodes: serde_json::Value,
    pub edges: serde_json::Value,
}

/// Header fields rewritten when a new version is saved.
#[derive(Debug, Clone)]
pub struct FlowHeader {
    pub name: String,
    pub trigger_type: String,
    pub trigger_config: Option<String>,
}

// ---------------------------------------------------------------------------
// flow_versions
// ---------------------------------------------------------------------------

/// An immutable snapshot of a flow's graph.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowVersionRow {
    pub id: i64,
    pub flow_id: i64,
    pub version_no: i64,
    pub nodes: serde_json::Value,
    pub edges: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// tasks
// ---------------------------------------------------------------------------

/// A persisted task instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub flow_id: i64,
    pub version_no: i64,
    pub title: String,
    pub flow_name: String,
    pub status: String,
    pub has_human_step: bool,
    pub assigned_to: Option<String>,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub flow_id: i64,
    pub version_no: i64,
    pub title: String,
    pub flow_name: String,
    pub has_human_step: bool,
    pub assigned_to: Option<String>,
}

/// Optional filters for [`crate::repository::tasks::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub flow_id: Option<i64>,
    /// Tasks the user triggered or has a pending human step on.
    pub assignee: Option<String>,
    /// Case-insensitive substring of the title or flow name.
    pub search: Option<String>,
    pub oldest_first: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ---------------------------------------------------------------------------
// task_steps
// ---------------------------------------------------------------------------

/// A persisted step row, one per DAG node instantiated within a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRow {
    pub id: i64,
    pub task_id: i64,
    pub node_id: String,
    pub label: String,
    /// `auto` | `human`
    pub kind: String,
    pub status: String,
    pub assigned_to: Option<String>,
    pub decision: Option<String>,
    pub output: Option<serde_json::Value>,
    pub ai_suggestion: Option<String>,
    pub reason: Option<String>,
    pub decided_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub task_id: i64,
    pub node_id: String,
    pub label: String,
    pub kind: String,
    pub status: String,
    pub assigned_to: Option<String>,
    pub ai_suggestion: Option<String>,
}

/// A human decision written onto a step.
#[derive(Debug, Clone)]
pub struct StepDecision {
    pub status: String,
    pub decision: String,
    pub output: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub decided_by: Option<String>,
}

/// Step timing joined with the owning task's flow name, used for analytics.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepTimingRow {
    pub label: String,
    pub kind: String,
    pub status: String,
    pub flow_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

/// A persisted outbound notification row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub task_id: i64,
    pub step_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub target_user: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: String,
    pub task_id: i64,
    pub step_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub target_user: Option<String>,
    pub payload: serde_json::Value,
}
