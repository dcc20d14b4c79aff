//! Notification dispatcher.
//!
//! Turns task lifecycle events into `notifications` rows and hands each new
//! record to a [`NotificationChannel`]. Delivery is best effort: a channel
//! error is logged and never fails the engine operation that caused it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use db::models::NewNotification;
use db::repository::notifications;
use db::{DbError, DbPool};

use crate::error::EngineError;
use crate::models::{convert_all, Notification, NotificationKind, Step, Task};

/// Most notifications returned by one listing.
pub const MAX_LISTED: i64 = 50;

#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outbound transport for notifications (chat bot, e-mail, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Channel that only writes a log line; consumers poll the API instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn deliver(&self, n: &Notification) -> Result<(), DeliveryError> {
        info!(
            id = n.id,
            kind = %n.kind,
            task_id = n.task_id,
            target = n.target_user.as_deref().unwrap_or("-"),
            "notification: {}",
            n.title
        );
        Ok(())
    }
}

/// A page of notifications plus the total matching the filter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationPage {
    pub total: i64,
    pub notifications: Vec<Notification>,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: DbPool,
    channel: Arc<dyn NotificationChannel>,
}

impl Dispatcher {
    pub fn new(pool: DbPool, channel: Arc<dyn NotificationChannel>) -> Self {
        Self { pool, channel }
    }

    /// A human step is waiting for its assignee.
    pub async fn human_step(
        &self,
        task: &Task,
        step: &Step,
        instructions: &str,
    ) -> Result<Notification, EngineError> {
        self.dispatch(NewNotification {
            kind: NotificationKind::HumanStep.to_string(),
            task_id: task.id,
            step_id: Some(step.id),
            title: format!("{}: '{}' needs your decision", task.title, step.label),
            content: instructions.to_string(),
            target_user: step.assigned_to.clone(),
            payload: json!({
                "flow_name": task.flow_name,
                "node_id": step.node_id,
                "instructions": instructions,
                "ai_suggestion": step.ai_suggestion,
            }),
        })
        .await
    }

    /// A task failed (tool failure or manual termination).
    pub async fn alert(
        &self,
        task: &Task,
        step: Option<&Step>,
        reason: &str,
    ) -> Result<Notification, EngineError> {
        self.dispatch(NewNotification {
            kind: NotificationKind::Alert.to_string(),
            task_id: task.id,
            step_id: step.map(|s| s.id),
            title: format!("{} failed", task.title),
            content: reason.to_string(),
            target_user: task.assigned_to.clone(),
            payload: json!({
                "flow_name": task.flow_name,
                "node_id": step.map(|s| s.node_id.as_str()),
                "label": step.map(|s| s.label.as_str()),
                "reason": reason,
            }),
        })
        .await
    }

    /// Reminder for a human step that has been waiting `wait_seconds`.
    pub async fn urge(
        &self,
        task: &Task,
        step: &Step,
        wait_seconds: i64,
    ) -> Result<Notification, EngineError> {
        self.dispatch(NewNotification {
            kind: NotificationKind::Urge.to_string(),
            task_id: task.id,
            step_id: Some(step.id),
            title: format!("Reminder: '{}' in {}", step.label, task.title),
            content: format!("waiting for {}", crate::analytics::duration_label(wait_seconds as f64)),
            target_user: step.assigned_to.clone(),
            payload: json!({
                "flow_name": task.flow_name,
                "node_id": step.node_id,
                "wait_seconds": wait_seconds,
            }),
        })
        .await
    }

    async fn dispatch(&self, new: NewNotification) -> Result<Notification, EngineError> {
        let row = notifications::insert_notification(&self.pool, new).await?;
        let notification = Notification::try_from(row)?;
        if let Err(e) = self.channel.deliver(&notification).await {
            warn!(id = notification.id, "notification delivery failed: {e}");
        }
        Ok(notification)
    }

    /// Newest first, at most [`MAX_LISTED`].
    pub async fn list(
        &self,
        kind: Option<NotificationKind>,
        pending_only: bool,
    ) -> Result<NotificationPage, EngineError> {
        let kind = kind.map(|k| k.as_str());
        let total = notifications::count_notifications(&self.pool, kind, pending_only).await?;
        let rows = notifications::list_notifications(&self.pool, kind, pending_only, MAX_LISTED).await?;
        Ok(NotificationPage { total, notifications: convert_all(rows)? })
    }

    pub async fn for_task(&self, task_id: i64) -> Result<Vec<Notification>, EngineError> {
        convert_all(notifications::list_for_task(&self.pool, task_id).await?)
    }

    /// Called by the channel collaborator once it has acted on a record.
    pub async fn mark_processed(&self, id: i64) -> Result<(), EngineError> {
        notifications::mark_processed(&self.pool, id).await.map_err(|e| match e {
            DbError::NotFound => EngineError::NotificationNotFound(id),
            other => other.into(),
        })
    }
}
