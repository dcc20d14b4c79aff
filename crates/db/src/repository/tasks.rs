//! Task instance repository functions.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{NewTask, TaskFilter, TaskRow},
};

const TASK_COLUMNS: &str = "id, flow_id, version_no, title, flow_name, status, has_human_step, \
     assigned_to, reason, started_at, finished_at, created_at";

/// Create a new task record in `pending` status.
pub async fn create_task(pool: &DbPool, task: NewTask) -> Result<TaskRow, DbError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!(
        r#"
        INSERT INTO tasks (flow_id, version_no, title, flow_name, status, has_human_step, assigned_to, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(task.flow_id)
    .bind(task.version_no)
    .bind(&task.title)
    .bind(&task.flow_name)
    .bind(task.has_human_step)
    .bind(&task.assigned_to)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single task by its primary key.
pub async fn get_task(pool: &DbPool, id: i64) -> Result<TaskRow, DbError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(row)
}

const TASK_FILTER: &str = r#"
    (?1 IS NULL OR status = ?1)
    AND (?2 IS NULL OR flow_id = ?2)
    AND (?3 IS NULL OR assigned_to = ?3 OR EXISTS (
        SELECT 1 FROM task_steps s
        WHERE s.task_id = tasks.id AND s.status = 'pending' AND s.assigned_to = ?3))
    AND (?4 IS NULL OR title LIKE '%' || ?4 || '%' OR flow_name LIKE '%' || ?4 || '%')
"#;

/// List tasks honouring the optional filters, newest first unless
/// `oldest_first` is set.
pub async fn list_tasks(pool: &DbPool, filter: &TaskFilter) -> Result<Vec<TaskRow>, DbError> {
    let order = if filter.oldest_first { "ASC" } else { "DESC" };
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE {TASK_FILTER}
        ORDER BY created_at {order}, id {order}
        LIMIT ?5 OFFSET ?6
        "#
    ))
    .bind(&filter.status)
    .bind(filter.flow_id)
    .bind(&filter.assignee)
    .bind(&filter.search)
    .bind(filter.limit.unwrap_or(-1))
    .bind(filter.offset.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Count tasks matching the same filters as [`list_tasks`] (paging ignored).
pub async fn count_tasks(pool: &DbPool, filter: &TaskFilter) -> Result<i64, DbError> {
    let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tasks WHERE {TASK_FILTER}"))
        .bind(&filter.status)
        .bind(filter.flow_id)
        .bind(&filter.assignee)
        .bind(&filter.search)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Move a task to `running`, stamping `started_at` the first time only and
/// clearing any terminal bookkeeping left from a rejection.
pub async fn mark_task_running(pool: &DbPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'running', started_at = COALESCE(started_at, ?), finished_at = NULL, reason = NULL
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Move a task into a terminal `status`, recording `finished_at` and an
/// optional human-readable `reason`.
pub async fn finish_task(
    pool: &DbPool,
    id: i64,
    status: &str,
    reason: Option<&str>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, reason = COALESCE(?, reason), finished_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(reason)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Distinct flow names with at least one task, alphabetically.
pub async fn list_flow_names(pool: &DbPool) -> Result<Vec<String>, DbError> {
    let names = sqlx::query_scalar("SELECT DISTINCT flow_name FROM tasks ORDER BY flow_name")
        .fetch_all(pool)
        .await?;
    Ok(names)
}
