//! Flow version history. Versions are append-only: nothing here updates or
//! deletes a `flow_versions` row.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{FlowHeader, FlowVersionRow},
};

const VERSION_COLUMNS: &str = "id, flow_id, version_no, nodes, edges, created_at";

/// Append a new version (`max(version_no) + 1`) and make it current.
///
/// When `header` is given the flow's name and trigger settings are rewritten
/// in the same transaction.
pub async fn append_version(
    pool: &DbPool,
    flow_id: i64,
    nodes: &serde_json::Value,
    edges: &serde_json::Value,
    header: Option<&FlowHeader>,
) -> Result<FlowVersionRow, DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let next: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_no), 0) + 1 FROM flow_versions WHERE flow_id = ?",
    )
    .bind(flow_id)
    .fetch_one(&mut *tx)
    .await?;

    let updated = match header {
        Some(h) => {
            sqlx::query(
                r#"
                UPDATE flows
                SET current_version = ?, name = ?, trigger_type = ?, trigger_config = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(next)
            .bind(&h.name)
            .bind(&h.trigger_type)
            .bind(&h.trigger_config)
            .bind(now)
            .bind(flow_id)
            .execute(&mut *tx)
            .await?
        }
        None => {
            sqlx::query("UPDATE flows SET current_version = ?, updated_at = ? WHERE id = ?")
                .bind(next)
                .bind(now)
                .bind(flow_id)
                .execute(&mut *tx)
                .await?
        }
    };

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    let row = sqlx::query_as::<_, FlowVersionRow>(&format!(
        r#"
        INSERT INTO flow_versions (flow_id, version_no, nodes, edges, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING {VERSION_COLUMNS}
        "#
    ))
    .bind(flow_id)
    .bind(next)
    .bind(nodes)
    .bind(edges)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Fetch one version of a flow.
pub async fn get_version(
    pool: &DbPool,
    flow_id: i64,
    version_no: i64,
) -> Result<FlowVersionRow, DbError> {
    let row = sqlx::query_as::<_, FlowVersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM flow_versions WHERE flow_id = ? AND version_no = ?"
    ))
    .bind(flow_id)
    .bind(version_no)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// All versions of a flow, oldest first.
pub async fn list_versions(pool: &DbPool, flow_id: i64) -> Result<Vec<FlowVersionRow>, DbError> {
    let rows = sqlx::query_as::<_, FlowVersionRow>(&format!(
        "SELECT {VERSION_COLUMNS} FROM flow_versions WHERE flow_id = ? ORDER BY version_no"
    ))
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
