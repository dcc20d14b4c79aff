//! Task step repository functions.
//!
//! Status-changing updates are guarded by the expected current status so a
//! stale writer cannot overwrite a newer transition; a guarded update that
//! matches nothing returns [`DbError::NotFound`].

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{NewStep, StepDecision, StepRow, StepTimingRow},
};

const STEP_COLUMNS: &str = "id, task_id, node_id, label, kind, status, assigned_to, decision, \
     output, ai_suggestion, reason, decided_by, started_at, finished_at";

/// Insert the step for a node. A second step for the same `(task, node)`
/// yields [`DbError::Conflict`].
pub async fn insert_step(pool: &DbPool, step: NewStep) -> Result<StepRow, DbError> {
    let row = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        INSERT INTO task_steps (task_id, node_id, label, kind, status, assigned_to, ai_suggestion, started_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(step.task_id)
    .bind(&step.node_id)
    .bind(&step.label)
    .bind(&step.kind)
    .bind(&step.status)
    .bind(&step.assigned_to)
    .bind(&step.ai_suggestion)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single step by its primary key.
pub async fn get_step(pool: &DbPool, id: i64) -> Result<StepRow, DbError> {
    let row = sqlx::query_as::<_, StepRow>(&format!("SELECT {STEP_COLUMNS} FROM task_steps WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// All steps of a task in creation order.
pub async fn list_steps(pool: &DbPool, task_id: i64) -> Result<Vec<StepRow>, DbError> {
    let rows = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM task_steps WHERE task_id = ? ORDER BY id"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Every step currently waiting for a human, oldest first.
pub async fn list_pending_human_steps(pool: &DbPool) -> Result<Vec<StepRow>, DbError> {
    let rows = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM task_steps WHERE kind = 'human' AND status = 'pending' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Re-arm a `pending` step as `running` with a fresh start time.
pub async fn mark_step_running(pool: &DbPool, id: i64) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE task_steps SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
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

/// Record the outcome of a running automatic step (`completed` or `failed`).
pub async fn finish_running_step(
    pool: &DbPool,
    id: i64,
    status: &str,
    output: &serde_json::Value,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE task_steps
        SET status = ?, output = ?, finished_at = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(status)
    .bind(output)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Put a `running` automatic step back to `pending`, keeping `output` as a
/// record of the discarded result. Used when the task ended while the tool
/// was still in flight.
pub async fn abandon_running_step(pool: &DbPool, id: i64, output: &serde_json::Value) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE task_steps SET status = 'pending', output = ? WHERE id = ? AND status = 'running'",
    )
    .bind(output)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Write a human decision onto a step that is still waiting for one.
pub async fn decide_step(pool: &DbPool, id: i64, decision: &StepDecision) -> Result<StepRow, DbError> {
    let row = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        UPDATE task_steps
        SET status = ?, decision = ?, output = ?, reason = ?, decided_by = ?, finished_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(&decision.status)
    .bind(&decision.decision)
    .bind(&decision.output)
    .bind(&decision.reason)
    .bind(&decision.decided_by)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Overwrite the decision on a `rejected` step (proxy handling).
pub async fn override_rejected_step(
    pool: &DbPool,
    id: i64,
    decision: &StepDecision,
) -> Result<StepRow, DbError> {
    let row = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        UPDATE task_steps
        SET status = ?, decision = ?, output = ?, reason = ?, decided_by = ?, finished_at = ?
        WHERE id = ? AND status = 'rejected'
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(&decision.status)
    .bind(&decision.decision)
    .bind(&decision.output)
    .bind(&decision.reason)
    .bind(&decision.decided_by)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Force a step back to `pending`, clearing its outcome.
pub async fn reset_step(pool: &DbPool, id: i64) -> Result<StepRow, DbError> {
    let row = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        UPDATE task_steps
        SET status = 'pending', decision = NULL, output = NULL, reason = NULL,
            decided_by = NULL, started_at = ?, finished_at = NULL
        WHERE id = ?
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Timing data for every finished step, joined with its task's flow name.
pub async fn list_step_timings(pool: &DbPool) -> Result<Vec<StepTimingRow>, DbError> {
    let rows = sqlx::query_as::<_, StepTimingRow>(
        r#"
        SELECT ts.label, ts.kind, ts.status, t.flow_name, ts.started_at, ts.finished_at
        FROM task_steps ts
        JOIN tasks t ON t.id = ts.task_id
        WHERE ts.finished_at IS NOT NULL
        ORDER BY ts.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
