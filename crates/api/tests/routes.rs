use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use api::{router, AppState};
use db::pool::create_in_memory_pool;
use engine::Engine;

async fn app() -> (Router, Engine) {
    let engine = Engine::new(create_in_memory_pool().await.unwrap());
    (router(AppState::new(engine.clone())), engine)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>, user: Option<&str>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        req = req.header("x-user", user);
    }
    let req = match body {
        Some(b) => req.header("content-type", "application/json").body(Body::from(b.to_string())),
        None => req.body(Body::empty()),
    }
    .unwrap();

    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

fn approval_flow() -> Value {
    json!({
        "name": "Leave request",
        "nodes": [
            { "id": "check", "type": "auto", "label": "Check balance", "config": { "tool": "echo" } },
            { "id": "approve", "data": { "label": "Manager approval", "nodeType": "human" } }
        ],
        "edges": [{ "source": "check", "target": "approve" }]
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app().await;
    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn flows_can_be_created_updated_and_rolled_back() {
    let (app, _) = app().await;
    let (status, created) = send(&app, "POST", "/api/flows", Some(approval_flow()), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["current_version"], 1);
    assert_eq!(created["trigger_type"], "manual");
    let id = created["id"].as_i64().unwrap();

    let mut next = approval_flow();
    next["trigger_type"] = json!("cron");
    next["trigger_config"] = json!("0 9 * * 1-5");
    next["nodes"].as_array_mut().unwrap().push(json!({ "id": "file", "kind": "auto", "label": "File" }));
    next["edges"].as_array_mut().unwrap().push(json!({ "source": "approve", "target": "file" }));
    let (status, updated) = send(&app, "PUT", &format!("/api/flows/{id}"), Some(next), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["current_version"], 2);
    assert_eq!(updated["nodes"].as_array().unwrap().len(), 3);

    let (_, listed) = send(&app, "GET", "/api/flows", None, None).await;
    assert!(listed[0]["next_run_at"].is_string());

    let (_, diff) = send(&app, "GET", &format!("/api/flows/{id}/versions/diff?from=1&to=2"), None, None).await;
    assert_eq!(diff["added_nodes"], json!(["file"]));

    let (status, rolled) =
        send(&app, "POST", &format!("/api/flows/{id}/rollback"), Some(json!({ "version": 1 })), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rolled["current_version"], 3);
    assert_eq!(rolled["nodes"].as_array().unwrap().len(), 2);

    let (_, history) = send(&app, "GET", &format!("/api/flows/{id}/versions"), None, None).await;
    assert_eq!(history.as_array().unwrap().len(), 3);

    let (status, err) =
        send(&app, "POST", &format!("/api/flows/{id}/rollback"), Some(json!({ "version": 99 })), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "rollback_target_not_found");
}

#[tokio::test]
async fn invalid_flows_are_bad_requests() {
    let (app, _) = app().await;
    let cyclic = json!({
        "name": "Loop",
        "nodes": [
            { "id": "a", "kind": "auto", "label": "A" },
            { "id": "b", "kind": "auto", "label": "B" },
            { "id": "c", "kind": "auto", "label": "C" }
        ],
        "edges": [
            { "source": "a", "target": "b" },
            { "source": "b", "target": "c" },
            { "source": "c", "target": "b" }
        ]
    });
    let (status, body) = send(&app, "POST", "/api/flows", Some(cyclic), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_flow");

    let bad_cron = json!({ "name": "Cron", "trigger_type": "cron", "trigger_config": "soon", "nodes": [], "edges": [] });
    let (status, body) = send(&app, "POST", "/api/flows", Some(bad_cron), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_trigger");

    let (status, body) = send(&app, "GET", "/api/flows/404", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "flow_not_found");
}

#[tokio::test]
async fn human_step_round_trip_over_http() {
    let (app, engine) = app().await;
    let (_, flow) = send(&app, "POST", "/api/flows", Some(approval_flow()), None).await;
    let flow_id = flow["id"].as_i64().unwrap();

    let (status, started) = send(&app, "POST", &format!("/api/flows/{flow_id}/trigger"), None, Some("dana")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(started["message"].is_string());
    let task_id = started["task_id"].as_i64().unwrap();
    engine.tasks.wait_until_settled(task_id, Duration::from_secs(5)).await.unwrap();

    let (status, current) = send(&app, "GET", &format!("/api/tasks/{task_id}/steps/current"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["label"], "Manager approval");
    assert_eq!(current["assigned_to"], "dana");
    let step_id = current["id"].as_i64().unwrap();

    let (_, pending) = send(&app, "GET", "/api/bot/notifications?type=human_step", None, None).await;
    assert_eq!(pending["total"], 1);
    let note_id = pending["notifications"][0]["id"].as_i64().unwrap();
    assert_eq!(pending["notifications"][0]["type"], "human_step");

    let (status, _) = send(&app, "POST", &format!("/api/bot/notifications/{note_id}/process"), None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, after) = send(&app, "GET", "/api/bot/notifications?type=human_step", None, None).await;
    assert_eq!(after["total"], 0);

    let (status, decided) = send(
        &app,
        "POST",
        &format!("/api/tasks/{task_id}/steps/{step_id}/submit"),
        Some(json!({ "mode": "accept", "content": "looks fine" })),
        Some("erin"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decided["status"], "approved");
    assert_eq!(decided["decided_by"], "erin");

    engine.tasks.wait_until_settled(task_id, Duration::from_secs(5)).await.unwrap();
    let (_, task) = send(&app, "GET", &format!("/api/tasks/{task_id}"), None, None).await;
    assert_eq!(task["status"], "completed");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/tasks/{task_id}/steps/{step_id}/submit"),
        Some(json!({ "decision": "approved" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "step_not_pending");

    let (status, _) = send(&app, "GET", &format!("/api/tasks/{task_id}/steps/current"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, dag) = send(&app, "GET", &format!("/api/tasks/{task_id}/dag"), None, None).await;
    assert_eq!(dag["nodes"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn worker_board_lists_the_callers_tasks() {
    let (app, engine) = app().await;
    let mut flow = approval_flow();
    flow["nodes"][1]["data"]["config"] = json!({ "assignee": "erin" });
    let (_, flow) = send(&app, "POST", "/api/flows", Some(flow), None).await;
    let (_, started) = send(&app, "POST", &format!("/api/flows/{}/trigger", flow["id"]), None, Some("dana")).await;
    let task_id = started["task_id"].as_i64().unwrap();
    engine.tasks.wait_until_settled(task_id, Duration::from_secs(5)).await.unwrap();

    // The triggering user and the step's assignee both see the task.
    for user in ["dana", "erin"] {
        let (status, board) = send(&app, "GET", "/api/tasks/my", None, Some(user)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board["running_count"], 1);
        assert_eq!(board["pending_count"], 0);
        assert_eq!(board["running"][0]["id"], task_id);
    }

    let (_, board) = send(&app, "GET", "/api/tasks/my", None, Some("olga")).await;
    assert_eq!(board["running_count"], 0);
    assert_eq!(board["running"], json!([]));
}

#[tokio::test]
async fn terminate_accepts_an_empty_body() {
    let (app, engine) = app().await;
    let (_, flow) = send(&app, "POST", "/api/flows", Some(approval_flow()), None).await;
    let (_, started) = send(&app, "POST", &format!("/api/flows/{}/trigger", flow["id"]), None, None).await;
    let task_id = started["task_id"].as_i64().unwrap();
    engine.tasks.wait_until_settled(task_id, Duration::from_secs(5)).await.unwrap();

    let (status, urged) = send(&app, "POST", &format!("/api/tasks/{task_id}/urge"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(urged.as_array().unwrap().len(), 1);

    let (status, task) = send(&app, "POST", &format!("/api/tasks/{task_id}/terminate"), None, Some("olga")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "failed");
    assert_eq!(task["reason"], "terminated by olga");

    let (status, body) = send(&app, "POST", &format!("/api/tasks/{task_id}/urge"), None, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "not_urgeable");
}

#[tokio::test]
async fn task_listing_and_analytics_queries() {
    let (app, engine) = app().await;
    let (_, flow) = send(&app, "POST", "/api/flows", Some(approval_flow()), None).await;
    for _ in 0..2 {
        let (_, started) = send(&app, "POST", &format!("/api/flows/{}/trigger", flow["id"]), None, None).await;
        engine
            .tasks
            .wait_until_settled(started["task_id"].as_i64().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
    }

    let (_, page) = send(&app, "GET", "/api/tasks?status=running&limit=1", None, None).await;
    assert_eq!(page["total"], 2);
    assert_eq!(page["tasks"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "GET", "/api/tasks?status=sleeping", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, oldest) = send(&app, "GET", "/api/tasks?sort=created_at_asc", None, None).await;
    let (_, newest) = send(&app, "GET", "/api/tasks", None, None).await;
    assert_eq!(oldest["tasks"][0]["id"], newest["tasks"][1]["id"]);
    let (status, _) = send(&app, "GET", "/api/tasks?sort=sideways", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, found) = send(&app, "GET", "/api/tasks?search=leave", None, None).await;
    assert_eq!(found["total"], 2);
    let (_, none) = send(&app, "GET", "/api/tasks?search=payroll", None, None).await;
    assert_eq!(none["total"], 0);

    let (_, monitor) = send(&app, "GET", "/api/tasks/monitor", None, None).await;
    assert_eq!(monitor.as_array().unwrap().len(), 2);
    assert_eq!(monitor[0]["current_assignee"], "manager");

    let (status, trend) = send(&app, "GET", "/api/analytics/trend?days=7&flow_name=", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trend["total_created"], 2);
    assert_eq!(trend["points"].as_array().unwrap().len(), 7);

    let (status, body) = send(&app, "GET", "/api/analytics/trend?days=0", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_query");

    let (status, report) = send(&app, "GET", "/api/analytics/bottlenecks", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["days"], 30);

    let (_, names) = send(&app, "GET", "/api/analytics/flow-names", None, None).await;
    assert_eq!(names, json!({ "flow_names": ["Leave request"] }));
}
