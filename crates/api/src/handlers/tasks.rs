use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use engine::task_engine::{DagView, MonitorEntry, MyTasks, TaskPage};
use engine::{Decision, Notification, Step, Submission, Task, TaskQuery, TaskStatus};

use super::{non_blank, optional_body, Actor};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub flow_id: Option<i64>,
    pub search: Option<String>,
    /// `created_at_desc` (default) or `created_at_asc`.
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct SubmitDto {
    #[serde(alias = "mode")]
    pub decision: Decision,
    #[serde(default, alias = "content")]
    pub output: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ProxyDto {
    pub content: String,
}

#[derive(Deserialize, Default)]
pub struct TerminateDto {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult<Json<TaskPage>> {
    let status = non_blank(q.status)
        .map(|s| s.parse::<TaskStatus>().map_err(|_| ApiError::BadRequest(format!("unknown task status '{s}'"))))
        .transpose()?;
    if q.limit.is_some_and(|l| l < 0) || q.offset.is_some_and(|o| o < 0) {
        return Err(ApiError::BadRequest("limit and offset must not be negative".into()));
    }
    let oldest_first = match non_blank(q.sort).as_deref() {
        None | Some("created_at_desc") => false,
        Some("created_at_asc") => true,
        Some(other) => return Err(ApiError::BadRequest(format!("unknown sort '{other}'"))),
    };
    let query = TaskQuery {
        status,
        flow_id: q.flow_id,
        assignee: None,
        search: non_blank(q.search),
        oldest_first,
        limit: q.limit,
        offset: q.offset,
    };
    Ok(Json(state.engine.tasks.list_tasks(&query).await?))
}

pub async fn mine(State(state): State<AppState>, Actor(actor): Actor) -> ApiResult<Json<MyTasks>> {
    Ok(Json(state.engine.tasks.my_tasks(&actor).await?))
}

pub async fn monitor(State(state): State<AppState>) -> ApiResult<Json<Vec<MonitorEntry>>> {
    Ok(Json(state.engine.tasks.monitor().await?))
}

pub async fn get(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<Task>> {
    Ok(Json(state.engine.tasks.get_task(id).await?))
}

pub async fn dag(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<DagView>> {
    Ok(Json(state.engine.tasks.dag_view(id).await?))
}

pub async fn steps(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<Vec<Step>>> {
    Ok(Json(state.engine.tasks.steps(id).await?))
}

pub async fn current_step(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<Step>> {
    state
        .engine
        .tasks
        .current_step(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {id} has no pending step")))
}

pub async fn submit(
    Path((id, step_id)): Path<(i64, i64)>,
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(payload): Json<SubmitDto>,
) -> ApiResult<Json<Step>> {
    let submission = Submission {
        decision: payload.decision,
        output: payload.output,
        reason: non_blank(payload.reason),
        actor,
    };
    Ok(Json(state.engine.tasks.submit(id, step_id, submission).await?))
}

/// Development aid: put a step back to `pending`.
pub async fn reset(Path((id, step_id)): Path<(i64, i64)>, State(state): State<AppState>) -> ApiResult<Json<Step>> {
    Ok(Json(state.engine.tasks.reset_step(id, step_id).await?))
}

pub async fn proxy(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(payload): Json<ProxyDto>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.engine.tasks.proxy_submit(id, payload.content, actor).await?))
}

pub async fn urge(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.engine.tasks.urge(id).await?))
}

pub async fn terminate(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Actor(actor): Actor,
    body: Bytes,
) -> ApiResult<Json<Task>> {
    let payload: TerminateDto = optional_body(&body)?;
    Ok(Json(state.engine.tasks.terminate(id, payload.reason, actor).await?))
}
