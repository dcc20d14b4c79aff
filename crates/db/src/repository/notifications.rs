//! Notification records written by the dispatcher and consumed by the
//! bot/UI channel.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{NewNotification, NotificationRow},
};

const NOTIFICATION_COLUMNS: &str =
    "id, type, task_id, step_id, title, content, target_user, payload, processed, created_at";

/// Insert a notification with `processed = false`.
pub async fn insert_notification(
    pool: &DbPool,
    notification: NewNotification,
) -> Result<NotificationRow, DbError> {
    let row = sqlx::query_as::<_, NotificationRow>(&format!(
        r#"
        INSERT INTO notifications (type, task_id, step_id, title, content, target_user, payload, processed, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
        RETURNING {NOTIFICATION_COLUMNS}
        "#
    ))
    .bind(&notification.kind)
    .bind(notification.task_id)
    .bind(notification.step_id)
    .bind(&notification.title)
    .bind(&notification.content)
    .bind(&notification.target_user)
    .bind(&notification.payload)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Newest notifications first, optionally restricted to one `kind` and/or
/// to those not yet processed.
pub async fn list_notifications(
    pool: &DbPool,
    kind: Option<&str>,
    pending_only: bool,
    limit: i64,
) -> Result<Vec<NotificationRow>, DbError> {
    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        r#"
        SELECT {NOTIFICATION_COLUMNS} FROM notifications
        WHERE (?1 IS NULL OR type = ?1) AND (?2 = 0 OR processed = 0)
        ORDER BY id DESC
        LIMIT ?3
        "#
    ))
    .bind(kind)
    .bind(pending_only)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Count notifications with the same filters as [`list_notifications`].
pub async fn count_notifications(
    pool: &DbPool,
    kind: Option<&str>,
    pending_only: bool,
) -> Result<i64, DbError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE (?1 IS NULL OR type = ?1) AND (?2 = 0 OR processed = 0)",
    )
    .bind(kind)
    .bind(pending_only)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// All notifications that reference a task, oldest first.
pub async fn list_for_task(pool: &DbPool, task_id: i64) -> Result<Vec<NotificationRow>, DbError> {
    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE task_id = ? ORDER BY id"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Flag a notification as acted upon by the channel collaborator.
pub async fn mark_processed(pool: &DbPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE notifications SET processed = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
