//! End-to-end task scenarios against an in-memory database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use db::pool::create_in_memory_pool;
use engine::{
    AutoConfig, Decision, EdgeSpec, Engine, EngineError, FlowDefinition, FlowInput, FlowValidationError,
    HumanConfig, NodeSpec, NotificationKind, StepKind, StepStatus, Submission, TaskEngine, TaskStatus,
    TriggerSource, TriggerType,
};
use nodes::mock::MockTool;
use nodes::ToolRegistry;

const SETTLE: Duration = Duration::from_secs(5);

fn auto(id: &str, label: &str, tool: &str) -> NodeSpec {
    NodeSpec::auto(id, label, AutoConfig { tool: tool.into(), ..AutoConfig::default() })
}

fn failing(id: &str, label: &str) -> NodeSpec {
    NodeSpec::auto(id, label, AutoConfig { should_fail: true, ..AutoConfig::default() })
}

fn human(id: &str, label: &str) -> NodeSpec {
    NodeSpec::human(
        id,
        label,
        HumanConfig { instructions: format!("Please check '{label}'"), ..HumanConfig::default() },
    )
}

fn chain(nodes: Vec<NodeSpec>) -> FlowDefinition {
    let edges = nodes.windows(2).map(|w| EdgeSpec::new(w[0].id.clone(), w[1].id.clone())).collect();
    FlowDefinition::new(nodes, edges)
}

fn manual(name: &str, definition: FlowDefinition) -> FlowInput {
    FlowInput { name: name.into(), trigger_type: TriggerType::Manual, trigger_config: None, definition }
}

fn submission(decision: Decision, output: Option<serde_json::Value>, reason: Option<&str>) -> Submission {
    Submission { decision, output, reason: reason.map(str::to_owned), actor: "alice".into() }
}

/// Engine whose registry also knows the `work` mock tool.
async fn engine_with(mock: Arc<MockTool>) -> Engine {
    let pool = create_in_memory_pool().await.unwrap();
    let mut tools = ToolRegistry::with_builtins();
    tools.register("work", mock);
    Engine::with_tasks(TaskEngine::builder(pool).tools(tools).build())
}

async fn engine() -> Engine {
    engine_with(Arc::new(MockTool::returning(json!({ "ok": true })))).await
}

async fn run(engine: &Engine, definition: FlowDefinition) -> (i64, i64) {
    let flow = engine.flows.create(manual("Scenario", definition)).await.unwrap();
    let task = engine.tasks.trigger(flow.flow.id, TriggerSource::manual("alice")).await.unwrap();
    engine.tasks.wait_until_settled(task.id, SETTLE).await.unwrap();
    (flow.flow.id, task.id)
}

#[tokio::test]
async fn linear_chain_completes_in_label_order() {
    let mock = Arc::new(MockTool::returning(json!({ "ok": true })));
    let engine = engine_with(mock.clone()).await;
    let nodes = (1..=5).map(|i| auto(&format!("n{i}"), &format!("Step {i}"), "work")).collect();
    let (_, task_id) = run(&engine, chain(nodes)).await;

    let task = engine.tasks.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.finished_at.is_some());
    assert_eq!(task.title, "[manual] Scenario");

    let steps = engine.tasks.steps(task_id).await.unwrap();
    let labels: Vec<&str> = steps.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["Step 1", "Step 2", "Step 3", "Step 4", "Step 5"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(mock.called_nodes(), vec!["n1", "n2", "n3", "n4", "n5"]);
}

#[tokio::test]
async fn failing_node_fails_the_task_and_alerts() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![auto("a", "Fetch", "echo"), failing("b", "Break")])).await;

    let task = engine.tasks.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.reason.is_some());

    let steps = engine.tasks.steps(task_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Failed);

    let alerts: Vec<_> = engine
        .notifications
        .for_task(task_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Alert)
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].task_id, task_id);
    assert_eq!(alerts[0].step_id, Some(steps[1].id));
    assert!(!alerts[0].processed);
}

#[tokio::test]
async fn failure_blocks_descendants() {
    let mock = Arc::new(MockTool::returning(json!({})));
    let engine = engine_with(mock.clone()).await;
    let (_, task_id) = run(
        &engine,
        chain(vec![auto("a", "A", "work"), failing("b", "B"), auto("c", "C", "work")]),
    )
    .await;

    let steps = engine.tasks.steps(task_id).await.unwrap();
    assert_eq!(steps.iter().filter(|s| s.status == StepStatus::Failed).count(), 1);
    assert!(steps.iter().all(|s| s.node_id != "c"));
    assert_eq!(mock.called_nodes(), vec!["a"]);
}

#[tokio::test]
async fn parallel_failures_leave_a_single_failed_step() {
    let engine = engine().await;
    let definition = FlowDefinition::new(vec![failing("a", "Left"), failing("b", "Right")], vec![]);
    let (_, task_id) = run(&engine, definition).await;

    let task = engine.tasks.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let steps = engine.tasks.steps(task_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps.iter().filter(|s| s.status == StepStatus::Failed).count(), 1);
    let other = steps.iter().find(|s| s.status != StepStatus::Failed).unwrap();
    assert_eq!(other.status, StepStatus::Pending);
    assert!(other.output.as_ref().is_some_and(|o| o.get("error").is_some()));

    let alerts = engine
        .notifications
        .for_task(task_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Alert)
        .count();
    assert_eq!(alerts, 1);
}

#[tokio::test]
async fn unknown_tool_is_a_task_failure() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![auto("a", "Teleport", "teleport")])).await;

    assert_eq!(engine.tasks.get_task(task_id).await.unwrap().status, TaskStatus::Failed);
    let steps = engine.tasks.steps(task_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn empty_flow_cannot_be_triggered() {
    let engine = engine().await;
    let flow = engine.flows.create(manual("Draft", FlowDefinition::default())).await.unwrap();
    let err = engine.tasks.trigger(flow.flow.id, TriggerSource::Scheduled).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidFlow(FlowValidationError::EmptyFlow)));
}

#[tokio::test]
async fn parallel_branches_join_before_the_sink() {
    let mock = Arc::new(MockTool::delayed(Duration::from_millis(20), json!({})));
    let engine = engine_with(mock.clone()).await;
    let definition = FlowDefinition::new(
        vec![
            auto("start", "Start", "work"),
            auto("left", "Left", "work"),
            auto("right", "Right", "work"),
            auto("join", "Join", "work"),
        ],
        vec![
            EdgeSpec::new("start", "left"),
            EdgeSpec::new("start", "right"),
            EdgeSpec::new("left", "join"),
            EdgeSpec::new("right", "join"),
        ],
    );
    let (_, task_id) = run(&engine, definition).await;

    assert_eq!(engine.tasks.get_task(task_id).await.unwrap().status, TaskStatus::Completed);
    let called = mock.called_nodes();
    assert_eq!(called.len(), 4);
    assert_eq!(called.first().map(String::as_str), Some("start"));
    assert_eq!(called.last().map(String::as_str), Some("join"));
}

#[tokio::test]
async fn human_step_waits_and_notifies_the_trigger_user() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Approve"), auto("a", "Archive", "echo")])).await;

    let task = engine.tasks.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.has_human_step);

    let current = engine.tasks.current_step(task_id).await.unwrap().unwrap();
    assert_eq!(current.kind, StepKind::Human);
    assert_eq!(current.assigned_to.as_deref(), Some("alice"));

    let notes = engine.notifications.for_task(task_id).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NotificationKind::HumanStep);
    assert_eq!(notes[0].target_user.as_deref(), Some("alice"));

    let view = engine.tasks.dag_view(task_id).await.unwrap();
    let status_of = |id: &str| view.nodes.iter().find(|n| n.id == id).unwrap().status.clone();
    assert_eq!(status_of("h"), "pending");
    assert_eq!(status_of("a"), "waiting");

    let monitor = engine.tasks.monitor().await.unwrap();
    let entry = monitor.iter().find(|m| m.task.id == task_id).unwrap();
    assert_eq!(entry.current_step.as_deref(), Some("Approve"));
    assert!(!entry.overdue);
}

#[tokio::test]
async fn approval_resumes_the_flow() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Approve"), auto("a", "Archive", "echo")])).await;
    let step = engine.tasks.current_step(task_id).await.unwrap().unwrap();

    let decided = engine
        .tasks
        .submit(task_id, step.id, submission(Decision::Modified, Some(json!("edited")), None))
        .await
        .unwrap();
    assert_eq!(decided.status, StepStatus::Approved);
    assert_eq!(decided.decision, Some(Decision::Modified));
    assert_eq!(decided.decided_by.as_deref(), Some("alice"));

    let task = engine.tasks.wait_until_settled(task_id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let again = engine.tasks.submit(task_id, step.id, submission(Decision::Approved, None, None)).await;
    assert!(matches!(again, Err(EngineError::StepNotPending { .. })));
}

#[tokio::test]
async fn invalid_submissions_are_refused() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![auto("a", "Fetch", "echo"), human("h", "Review")])).await;
    let steps = engine.tasks.steps(task_id).await.unwrap();
    let (auto_step, human_step) = (&steps[0], &steps[1]);

    let on_auto = engine.tasks.submit(task_id, auto_step.id, submission(Decision::Approved, None, None)).await;
    assert!(matches!(on_auto, Err(EngineError::InvalidSubmission(_))));

    let blank = engine
        .tasks
        .submit(task_id, human_step.id, submission(Decision::Modified, Some(json!("  ")), None))
        .await;
    assert!(matches!(blank, Err(EngineError::InvalidSubmission(_))));

    let foreign = engine.tasks.submit(task_id + 100, human_step.id, submission(Decision::Approved, None, None)).await;
    assert!(matches!(foreign, Err(EngineError::TaskNotFound(_)) | Err(EngineError::StepNotFound { .. })));
}

#[tokio::test]
async fn rejection_then_proxy_completes_the_task() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Sign off")])).await;

    // Proxy handling is only for rejected tasks.
    let early = engine.tasks.proxy_submit(task_id, "done".into(), "boss".into()).await;
    assert!(matches!(early, Err(EngineError::TaskNotRejected { .. })));

    let step = engine.tasks.current_step(task_id).await.unwrap().unwrap();
    let rejected = engine
        .tasks
        .submit(task_id, step.id, submission(Decision::Rejected, None, Some("X")))
        .await
        .unwrap();
    assert_eq!(rejected.status, StepStatus::Rejected);

    let task = engine.tasks.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(task.reason.as_deref(), Some("X"));

    let resumed = engine.tasks.proxy_submit(task_id, "signed by proxy".into(), "boss".into()).await.unwrap();
    assert!(matches!(resumed.status, TaskStatus::Running | TaskStatus::Completed));

    let task = engine.tasks.wait_until_settled(task_id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let step = &engine.tasks.steps(task_id).await.unwrap()[0];
    assert_eq!(step.status, StepStatus::Approved);
    assert_eq!(step.output, Some(json!("signed by proxy")));
    assert_eq!(step.decided_by.as_deref(), Some("boss"));
    assert!(task.reason.is_none());
}

#[tokio::test]
async fn one_rejection_aborts_parallel_human_branches() {
    let engine = engine().await;
    let definition = FlowDefinition::new(
        vec![human("legal", "Legal review"), human("finance", "Finance review"), auto("file", "File", "echo")],
        vec![EdgeSpec::new("legal", "file"), EdgeSpec::new("finance", "file")],
    );
    let (_, task_id) = run(&engine, definition).await;

    let steps = engine.tasks.steps(task_id).await.unwrap();
    let legal = steps.iter().find(|s| s.node_id == "legal").unwrap().clone();
    let finance = steps.iter().find(|s| s.node_id == "finance").unwrap().clone();
    engine.tasks.submit(task_id, legal.id, submission(Decision::Rejected, None, Some("missing clause"))).await.unwrap();

    assert_eq!(engine.tasks.get_task(task_id).await.unwrap().status, TaskStatus::Rejected);
    let sibling = engine.tasks.steps(task_id).await.unwrap().into_iter().find(|s| s.id == finance.id).unwrap();
    assert_eq!(sibling.status, StepStatus::Pending);
    let late = engine.tasks.submit(task_id, finance.id, submission(Decision::Approved, None, None)).await;
    assert!(matches!(late, Err(EngineError::TaskNotActive { .. })));

    // Proxy takes over the rejected branch; the other one still waits.
    let resumed = engine.tasks.proxy_submit(task_id, "clause added".into(), "boss".into()).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Running);
    assert!(resumed.reason.is_none());
    let steps = engine.tasks.steps(task_id).await.unwrap();
    assert_eq!(steps.iter().find(|s| s.id == legal.id).unwrap().status, StepStatus::Approved);
    assert_eq!(steps.iter().find(|s| s.id == finance.id).unwrap().status, StepStatus::Pending);

    engine.tasks.submit(task_id, finance.id, submission(Decision::Approved, None, None)).await.unwrap();
    let task = engine.tasks.wait_until_settled(task_id, SETTLE).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn rejection_halts_scheduling() {
    let mock = Arc::new(MockTool::returning(json!({})));
    let engine = engine_with(mock.clone()).await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Gate"), auto("a", "After", "work")])).await;

    let step = engine.tasks.current_step(task_id).await.unwrap().unwrap();
    engine.tasks.submit(task_id, step.id, submission(Decision::Rejected, None, None)).await.unwrap();
    let task = engine.tasks.wait_until_settled(task_id, SETTLE).await.unwrap();

    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(task.reason.as_deref(), Some("'Gate' rejected by alice"));
    assert_eq!(engine.tasks.steps(task_id).await.unwrap().len(), 1);
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn terminate_fails_an_active_task() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Wait")])).await;

    let task = engine.tasks.terminate(task_id, Some("duplicate".into()), "boss".into()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.reason.as_deref(), Some("terminated by boss: duplicate"));

    let alerts = engine.notifications.for_task(task_id).await.unwrap();
    assert!(alerts.iter().any(|n| n.kind == NotificationKind::Alert));

    let again = engine.tasks.terminate(task_id, None, "boss".into()).await;
    assert!(matches!(again, Err(EngineError::TaskNotActive { status: TaskStatus::Failed, .. })));
}

#[tokio::test]
async fn urge_reminds_pending_assignees() {
    let engine = engine().await;
    let (_, task_id) = run(&engine, chain(vec![human("h", "Review")])).await;

    let sent = engine.tasks.urge(task_id).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Urge);
    assert_eq!(sent[0].target_user.as_deref(), Some("alice"));
    assert!(sent[0].payload.get("wait_seconds").is_some());

    let (_, done) = run(&engine, chain(vec![auto("a", "Quick", "echo")])).await;
    assert!(matches!(engine.tasks.urge(done).await, Err(EngineError::NotUrgeable { .. })));
}

#[tokio::test]
async fn reset_reruns_an_automatic_step() {
    let mock = Arc::new(MockTool::returning(json!({})));
    let engine = engine_with(mock.clone()).await;
    let (_, task_id) = run(&engine, chain(vec![auto("a", "First", "work"), auto("b", "Second", "work")])).await;
    assert_eq!(mock.call_count(), 2);

    let first = engine.tasks.steps(task_id).await.unwrap()[0].clone();
    engine.tasks.reset_step(task_id, first.id).await.unwrap();
    let task = engine.tasks.wait_until_settled(task_id, SETTLE).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(mock.call_count(), 3);
    assert_eq!(engine.tasks.steps(task_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn tasks_stay_bound_to_their_version() {
    let engine = engine().await;
    let (flow_id, first_task) = run(&engine, chain(vec![human("h", "Hold")])).await;

    engine
        .versions
        .save(flow_id, manual("Scenario", chain(vec![auto("x", "X", "echo"), auto("y", "Y", "echo")])))
        .await
        .unwrap();
    let rolled = engine.versions.rollback(flow_id, 1).await.unwrap();
    assert_eq!(rolled.flow.current_version, 3);
    assert_eq!(rolled.nodes.len(), 1);

    let first = engine.tasks.get_task(first_task).await.unwrap();
    assert_eq!(first.version_no, 1);

    let next = engine.tasks.trigger(flow_id, TriggerSource::manual("alice")).await.unwrap();
    assert_eq!(next.version_no, 3);
}

#[tokio::test]
async fn trend_grows_with_the_window() {
    let engine = engine().await;
    for _ in 0..3 {
        run(&engine, chain(vec![auto("a", "Only", "echo")])).await;
    }

    let month = engine.analytics.trend(30, None).await.unwrap();
    let quarter = engine.analytics.trend(90, None).await.unwrap();
    assert_eq!(month.total_completed, 3);
    assert!(month.total_completed <= quarter.total_completed);
    assert_eq!(engine.analytics.flow_names().await.unwrap(), vec!["Scenario".to_string()]);

    assert!(matches!(engine.analytics.trend(0, None).await, Err(EngineError::InvalidQuery(_))));
    assert!(matches!(engine.analytics.trend(366, None).await, Err(EngineError::InvalidQuery(_))));
}
