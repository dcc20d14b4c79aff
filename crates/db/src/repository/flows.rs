//! Flow CRUD operations.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{FlowRow, FlowVersionRow, NewFlow},
};

const FLOW_COLUMNS: &str = "id, name, trigger_type, trigger_config, current_version, \
     last_scheduled_at, created_at, updated_at";

/// Insert a new flow and its version 1 in a single transaction, so a flow
/// row never exists without the version its `current_version` points at.
pub async fn create_flow(
    pool: &DbPool,
    flow: NewFlow,
) -> Result<(FlowRow, FlowVersionRow), DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, FlowRow>(&format!(
        r#"
        INSERT INTO flows (name, trigger_type, trigger_config, current_version, created_at, updated_at)
        VALUES (?, ?, ?, 1, ?, ?)
        RETURNING {FLOW_COLUMNS}
        "#
    ))
    .bind(&flow.name)
    .bind(&flow.trigger_type)
    .bind(&flow.trigger_config)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    let version = sqlx::query_as::<_, FlowVersionRow>(
        r#"
        INSERT INTO flow_versions (flow_id, version_no, nodes, edges, created_at)
        VALUES (?, 1, ?, ?, ?)
        RETURNING id, flow_id, version_no, nodes, edges, created_at
        "#,
    )
    .bind(row.id)
    .bind(&flow.nodes)
    .bind(&flow.edges)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((row, version))
}

/// Fetch a single flow by its primary key.
pub async fn get_flow(pool: &DbPool, id: i64) -> Result<FlowRow, DbError> {
    let row = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Return all flows, newest first.
pub async fn list_flows(pool: &DbPool) -> Result<Vec<FlowRow>, DbError> {
    let rows = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows ORDER BY id DESC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Return every flow that is scheduled by cron and still has an expression.
pub async fn list_cron_flows(pool: &DbPool) -> Result<Vec<FlowRow>, DbError> {
    let rows = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows \
         WHERE trigger_type = 'cron' AND trigger_config IS NOT NULL AND trigger_config <> '' \
         ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Atomically claim the cron slot starting at `slot` (unix seconds).
///
/// Returns `true` only for the caller that moved `last_scheduled_at`
/// forward; a second claim of the same or an older slot returns `false`.
pub async fn claim_schedule_slot(pool: &DbPool, flow_id: i64, slot: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE flows
        SET last_scheduled_at = ?
        WHERE id = ? AND (last_scheduled_at IS NULL OR last_scheduled_at < ?)
        "#,
    )
    .bind(slot)
    .bind(flow_id)
    .bind(slot)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
