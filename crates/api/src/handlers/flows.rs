use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use engine::flows::FlowSummary;
use engine::{FlowDefinition, FlowDetail, FlowInput, TriggerSource, TriggerType, Version, VersionDiff};

use super::Actor;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Deserialize)]
pub struct FlowDto {
    pub name: String,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<String>,
    #[serde(default)]
    pub nodes: Value,
    #[serde(default)]
    pub edges: Value,
}

impl FlowDto {
    /// `missing_trigger` applies when the body has no (or a null)
    /// `trigger_type`.
    fn into_input(self, missing_trigger: TriggerType) -> ApiResult<FlowInput> {
        Ok(FlowInput {
            definition: FlowDefinition::from_json(&self.nodes, &self.edges)?,
            name: self.name,
            trigger_type: self.trigger_type.unwrap_or(missing_trigger),
            trigger_config: self.trigger_config,
        })
    }
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub message: String,
    pub task_id: i64,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    pub from: i64,
    pub to: i64,
}

#[derive(Deserialize)]
pub struct RollbackDto {
    pub version: i64,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<FlowSummary>>> {
    Ok(Json(state.engine.flows.list().await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<FlowDto>,
) -> ApiResult<(StatusCode, Json<FlowDetail>)> {
    let flow = state.engine.flows.create(payload.into_input(TriggerType::Manual)?).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

pub async fn get(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<FlowDetail>> {
    Ok(Json(state.engine.flows.get(id).await?))
}

/// Saves a new version. A null `trigger_type` turns scheduling off.
pub async fn update(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<FlowDto>,
) -> ApiResult<Json<FlowDetail>> {
    let input = payload.into_input(TriggerType::None)?;
    Ok(Json(state.engine.versions.save(id, input).await?))
}

pub async fn trigger(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let task = state.engine.tasks.trigger(id, TriggerSource::manual(actor)).await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse { message: format!("task {} started", task.id), task_id: task.id }),
    ))
}

pub async fn versions(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<Vec<Version>>> {
    Ok(Json(state.engine.versions.list(id).await?))
}

pub async fn diff(
    Path(id): Path<i64>,
    Query(q): Query<DiffQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<VersionDiff>> {
    Ok(Json(state.engine.versions.diff(id, q.from, q.to).await?))
}

pub async fn rollback(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<RollbackDto>,
) -> ApiResult<Json<FlowDetail>> {
    Ok(Json(state.engine.versions.rollback(id, payload.version).await?))
}
