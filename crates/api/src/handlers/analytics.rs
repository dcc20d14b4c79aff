use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use engine::analytics::{Bottlenecks, Trend};

use super::non_blank;
use crate::error::ApiResult;
use crate::AppState;

const DEFAULT_DAYS: i64 = 30;

#[derive(Deserialize)]
pub struct WindowQuery {
    pub days: Option<i64>,
    pub flow_name: Option<String>,
}

pub async fn trend(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> ApiResult<Json<Trend>> {
    let flow_name = non_blank(q.flow_name);
    let trend = state.engine.analytics.trend(q.days.unwrap_or(DEFAULT_DAYS), flow_name.as_deref()).await?;
    Ok(Json(trend))
}

pub async fn bottlenecks(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Bottlenecks>> {
    let flow_name = non_blank(q.flow_name);
    let report = state
        .engine
        .analytics
        .bottlenecks(q.days.unwrap_or(DEFAULT_DAYS), flow_name.as_deref())
        .await?;
    Ok(Json(report))
}

pub async fn flow_names(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let names = state.engine.analytics.flow_names().await?;
    Ok(Json(json!({ "flow_names": names })))
}
