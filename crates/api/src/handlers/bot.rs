//! Polling endpoints for the chat-bot notification consumer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use engine::dispatcher::NotificationPage;
use engine::NotificationKind;

use super::non_blank;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Only unprocessed records; defaults to true.
    pub pending: Option<bool>,
}

pub async fn list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult<Json<NotificationPage>> {
    let kind = non_blank(q.kind)
        .map(|k| {
            k.parse::<NotificationKind>()
                .map_err(|_| ApiError::BadRequest(format!("unknown notification type '{k}'")))
        })
        .transpose()?;
    let page = state.engine.notifications.list(kind, q.pending.unwrap_or(true)).await?;
    Ok(Json(page))
}

pub async fn process(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.engine.notifications.mark_processed(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
