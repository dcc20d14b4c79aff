//! `api` crate: the REST surface over the engine.
//!
//! Routes live under `/api`; see [`router`]. The acting user is read from
//! the `X-User` header and defaults to `manager`.

pub mod error;
pub mod handlers;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use engine::Engine;

pub use error::{ApiError, ApiResult};
use handlers::{analytics, bot, flows, tasks};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/flows", get(flows::list).post(flows::create))
        .route("/api/flows/{id}", get(flows::get).put(flows::update))
        .route("/api/flows/{id}/trigger", post(flows::trigger))
        .route("/api/flows/{id}/versions", get(flows::versions))
        .route("/api/flows/{id}/versions/diff", get(flows::diff))
        .route("/api/flows/{id}/rollback", post(flows::rollback))
        .route("/api/tasks", get(tasks::list))
        .route("/api/tasks/my", get(tasks::mine))
        .route("/api/tasks/monitor", get(tasks::monitor))
        .route("/api/tasks/{id}", get(tasks::get))
        .route("/api/tasks/{id}/dag", get(tasks::dag))
        .route("/api/tasks/{id}/steps", get(tasks::steps))
        .route("/api/tasks/{id}/steps/current", get(tasks::current_step))
        .route("/api/tasks/{id}/steps/{step_id}/submit", post(tasks::submit))
        .route("/api/tasks/{id}/steps/{step_id}/reset", post(tasks::reset))
        .route("/api/tasks/{id}/proxy", post(tasks::proxy))
        .route("/api/tasks/{id}/urge", post(tasks::urge))
        .route("/api/tasks/{id}/terminate", post(tasks::terminate))
        .route("/api/analytics/trend", get(analytics::trend))
        .route("/api/analytics/bottlenecks", get(analytics::bottlenecks))
        .route("/api/analytics/flow-names", get(analytics::flow_names))
        .route("/api/bot/notifications", get(bot::list))
        .route("/api/bot/notifications/{id}/process", post(bot::process))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `bind` until Ctrl-C.
pub async fn serve(bind: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}
