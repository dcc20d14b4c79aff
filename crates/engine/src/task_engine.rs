//! Task engine: drives task instances through their flow version's DAG.
//!
//! `TaskEngine` is the central orchestrator:
//! 1. `trigger` binds a new task to the flow's current version and queues
//!    the first scan.
//! 2. A scan launches every ready node: automatic nodes get a `running`
//!    step and their tool is spawned; human nodes get a `pending` step and
//!    a notification, then the task simply waits.
//! 3. Tool completions, decisions, proxy handling, resets and termination
//!    are messages on the task's mailbox, so all state changes of one task
//!    are applied by a single worker, in order.
//! 4. Every step change re-runs the scan; when every node has succeeded the
//!    task completes.
//!
//! Nothing about a task lives only in memory: the steps table is the
//! execution state and the compiled DAG cache is derived from immutable
//! versions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use db::models::{NewStep, NewTask, StepDecision, TaskFilter};
use db::repository::{flows, steps, tasks, versions};
use db::{DbError, DbPool};
use nodes::{NoSuggestions, SuggestionProvider, ToolContext, ToolError, ToolRegistry};
use queue::{KeyedQueue, MessageHandler};

use crate::config::EngineConfig;
use crate::dag::{compile, CompiledDag};
use crate::dispatcher::{Dispatcher, LogChannel, NotificationChannel};
use crate::error::EngineError;
use crate::executor::{
    AssigneeResolver, AutoExecutor, ExecutorRegistry, HumanExecutor, Launch, LaunchContext, RoleMap,
    ToolLaunch,
};
use crate::models::{
    convert_all, Decision, EdgeSpec, Flow, NodeKind, NodeSpec, Notification, Step, StepKind,
    StepStatus, Submission, Task, TaskStatus, TriggerSource, Version,
};

// ---------------------------------------------------------------------------
// Mailbox messages
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Outcome of a spawned tool invocation.
struct ToolDone {
    step_id: i64,
    node_id: String,
    result: Result<Value, ToolError>,
}

enum TaskCommand {
    Advance,
    ToolFinished(ToolDone),
    Submit { step_id: i64, submission: Submission, reply: Reply<Step> },
    Proxy { content: String, actor: String, reply: Reply<Task> },
    Reset { step_id: i64, reply: Reply<Step> },
    Terminate { reason: Option<String>, actor: String, reply: Reply<Task> },
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Filters for [`TaskEngine::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub flow_id: Option<i64>,
    /// Tasks the user triggered or holds a pending human step on.
    pub assignee: Option<String>,
    /// Substring of the title or flow name, case-insensitive.
    pub search: Option<String>,
    pub oldest_first: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub total: i64,
    pub tasks: Vec<Task>,
}

/// A worker's board: their active tasks split by status.
#[derive(Debug, Clone, Serialize)]
pub struct MyTasks {
    pub pending: Vec<Task>,
    pub running: Vec<Task>,
    pub pending_count: usize,
    pub running_count: usize,
}

/// One node of a task's DAG with the status of its step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagNodeView {
    pub id: String,
    pub label: String,
    pub kind: StepKind,
    /// Step status, or `waiting` for nodes that have no step yet.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagView {
    pub nodes: Vec<DagNodeView>,
    pub edges: Vec<EdgeSpec>,
}

/// A task as shown on the manager's monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEntry {
    #[serde(flatten)]
    pub task: Task,
    pub current_step_id: Option<i64>,
    pub current_step: Option<String>,
    pub current_assignee: Option<String>,
    /// Seconds the oldest pending human step has been waiting.
    pub wait_seconds: Option<i64>,
    pub overdue: bool,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

struct EngineCore {
    pool: DbPool,
    executors: ExecutorRegistry,
    dispatcher: Dispatcher,
    config: EngineConfig,
    mailbox: KeyedQueue<i64, TaskCommand>,
    dags: Mutex<HashMap<(i64, i64), Arc<CompiledDag>>>,
}

/// Assembles a [`TaskEngine`] from its collaborators.
pub struct TaskEngineBuilder {
    pool: DbPool,
    tools: ToolRegistry,
    suggestions: Arc<dyn SuggestionProvider>,
    resolver: Arc<dyn AssigneeResolver>,
    channel: Arc<dyn NotificationChannel>,
    config: EngineConfig,
}

impl TaskEngineBuilder {
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn suggestions(mut self, provider: Arc<dyn SuggestionProvider>) -> Self {
        self.suggestions = provider;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AssigneeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TaskEngine {
        let executors = ExecutorRegistry::new(
            AutoExecutor::new(self.tools),
            HumanExecutor::new(self.suggestions, self.resolver, self.config.default_assignee.clone())
                .with_suggestion_timeout(self.config.suggestion_timeout),
        );
        TaskEngine {
            core: Arc::new(EngineCore {
                dispatcher: Dispatcher::new(self.pool.clone(), self.channel),
                pool: self.pool,
                executors,
                config: self.config,
                mailbox: KeyedQueue::new(),
                dags: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Cheap to clone; all clones share the same mailboxes and DAG cache.
#[derive(Clone)]
pub struct TaskEngine {
    core: Arc<EngineCore>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn map_task_lookup(task_id: i64) -> impl FnOnce(DbError) -> EngineError {
    move |e| match e {
        DbError::NotFound => EngineError::TaskNotFound(task_id),
        other => other.into(),
    }
}

fn log_notification(result: Result<Notification, EngineError>) {
    if let Err(e) = result {
        warn!("could not record notification: {e}");
    }
}

impl TaskEngine {
    /// Builder with the built-in tools, no suggestion provider, no role
    /// table and a log-only notification channel.
    pub fn builder(pool: DbPool) -> TaskEngineBuilder {
        TaskEngineBuilder {
            pool,
            tools: ToolRegistry::with_builtins(),
            suggestions: Arc::new(NoSuggestions),
            resolver: Arc::new(RoleMap::new()),
            channel: Arc::new(LogChannel),
            config: EngineConfig::default(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.core.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Create a task bound to the flow's current version and start it.
    ///
    /// # Errors
    /// [`EngineError::FlowNotFound`], or [`EngineError::InvalidFlow`] when
    /// the current version cannot be compiled (e.g. an empty draft).
    #[instrument(skip(self))]
    pub async fn trigger(&self, flow_id: i64, source: TriggerSource) -> Result<Task, EngineError> {
        let pool = &self.core.pool;
        let flow = Flow::try_from(flows::get_flow(pool, flow_id).await.map_err(|e| match e {
            DbError::NotFound => EngineError::FlowNotFound(flow_id),
            other => other.into(),
        })?)?;
        let dag = self.dag_for(flow.id, flow.current_version).await?;

        let row = tasks::create_task(
            pool,
            NewTask {
                flow_id,
                version_no: flow.current_version,
                title: format!("[{}] {}", source.title_tag(), flow.name),
                flow_name: flow.name.clone(),
                has_human_step: dag.has_human_step(),
                assigned_to: source.actor(),
            },
        )
        .await?;
        tasks::mark_task_running(pool, row.id).await?;
        let task = self.load_task(row.id).await?;

        info!(
            task_id = task.id,
            version = flow.current_version,
            nodes = dag.len(),
            "task created for flow '{}'",
            flow.name
        );
        self.enqueue(task.id, TaskCommand::Advance);
        Ok(task)
    }

    /// Record a human decision on a pending step.
    #[instrument(skip(self, submission), fields(decision = %submission.decision, actor = %submission.actor))]
    pub async fn submit(&self, task_id: i64, step_id: i64, submission: Submission) -> Result<Step, EngineError> {
        self.request(task_id, |reply| TaskCommand::Submit { step_id, submission, reply }).await
    }

    /// Complete a rejected task's rejected step on behalf of its assignee.
    #[instrument(skip(self, content))]
    pub async fn proxy_submit(&self, task_id: i64, content: String, actor: String) -> Result<Task, EngineError> {
        self.request(task_id, |reply| TaskCommand::Proxy { content, actor, reply }).await
    }

    /// Force a step back to `pending`. Development aid; bypasses the
    /// one-way task lifecycle.
    #[instrument(skip(self))]
    pub async fn reset_step(&self, task_id: i64, step_id: i64) -> Result<Step, EngineError> {
        self.request(task_id, |reply| TaskCommand::Reset { step_id, reply }).await
    }

    /// Fail a non-terminal task on a manager's request.
    #[instrument(skip(self))]
    pub async fn terminate(&self, task_id: i64, reason: Option<String>, actor: String) -> Result<Task, EngineError> {
        self.request(task_id, |reply| TaskCommand::Terminate { reason, actor, reply }).await
    }

    /// Remind the assignees of every pending human step of a running task.
    ///
    /// Returns the notifications that were recorded.
    #[instrument(skip(self))]
    pub async fn urge(&self, task_id: i64) -> Result<Vec<Notification>, EngineError> {
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(EngineError::NotUrgeable { task_id, reason: format!("task is {}", task.status) });
        }
        let waiting: Vec<Step> = self
            .load_steps(task_id)
            .await?
            .into_iter()
            .filter(|s| s.kind == StepKind::Human && s.status == StepStatus::Pending)
            .collect();
        if waiting.is_empty() {
            return Err(EngineError::NotUrgeable { task_id, reason: "no human step is waiting".into() });
        }

        let now = Utc::now();
        let mut sent = Vec::with_capacity(waiting.len());
        for step in &waiting {
            let wait = (now - step.started_at).num_seconds().max(0);
            match self.core.dispatcher.urge(&task, step, wait).await {
                Ok(n) => sent.push(n),
                Err(e) => warn!(task_id, step_id = step.id, "urge not recorded: {e}"),
            }
        }
        info!(task_id, reminders = sent.len(), "task urged");
        Ok(sent)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, task_id: i64) -> Result<Task, EngineError> {
        self.load_task(task_id).await
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage, EngineError> {
        let filter = TaskFilter {
            status: query.status.map(|s| s.to_string()),
            flow_id: query.flow_id,
            assignee: query.assignee.clone(),
            search: query.search.clone(),
            oldest_first: query.oldest_first,
            limit: query.limit,
            offset: query.offset,
        };
        let total = tasks::count_tasks(&self.core.pool, &filter).await?;
        let rows = tasks::list_tasks(&self.core.pool, &filter).await?;
        Ok(TaskPage { total, tasks: convert_all(rows)? })
    }

    /// `user`'s pending tasks (oldest first) and running tasks (newest
    /// first).
    pub async fn my_tasks(&self, user: &str) -> Result<MyTasks, EngineError> {
        let board = |status: TaskStatus, oldest_first: bool| TaskQuery {
            status: Some(status),
            assignee: Some(user.to_string()),
            oldest_first,
            ..TaskQuery::default()
        };
        let pending = self.list_tasks(&board(TaskStatus::Pending, true)).await?.tasks;
        let running = self.list_tasks(&board(TaskStatus::Running, false)).await?.tasks;
        Ok(MyTasks { pending_count: pending.len(), running_count: running.len(), pending, running })
    }

    /// Steps of a task in creation order.
    pub async fn steps(&self, task_id: i64) -> Result<Vec<Step>, EngineError> {
        self.load_task(task_id).await?;
        self.load_steps(task_id).await
    }

    /// The first step still waiting, if any.
    pub async fn current_step(&self, task_id: i64) -> Result<Option<Step>, EngineError> {
        Ok(self.steps(task_id).await?.into_iter().find(|s| s.status == StepStatus::Pending))
    }

    /// The task's DAG annotated with step statuses.
    pub async fn dag_view(&self, task_id: i64) -> Result<DagView, EngineError> {
        let task = self.load_task(task_id).await?;
        let dag = self.dag_for(task.flow_id, task.version_no).await?;
        let statuses: HashMap<String, StepStatus> = self
            .load_steps(task_id)
            .await?
            .into_iter()
            .map(|s| (s.node_id, s.status))
            .collect();

        let nodes = dag
            .nodes()
            .iter()
            .map(|n| DagNodeView {
                id: n.id.clone(),
                label: n.label.clone(),
                kind: n.kind.tag(),
                status: statuses.get(&n.id).map_or_else(|| "waiting".to_string(), ToString::to_string),
            })
            .collect();
        Ok(DagView { nodes, edges: dag.edges().to_vec() })
    }

    /// Every task, newest first, with its oldest pending human step and how
    /// long that step has been waiting.
    pub async fn monitor(&self) -> Result<Vec<MonitorEntry>, EngineError> {
        let all: Vec<Task> = convert_all(tasks::list_tasks(&self.core.pool, &TaskFilter::default()).await?)?;
        let mut waiting: HashMap<i64, Step> = HashMap::new();
        for step in convert_all::<_, Step>(steps::list_pending_human_steps(&self.core.pool).await?)? {
            waiting.entry(step.task_id).or_insert(step);
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(all.len());
        for task in all {
            let entry = match waiting.remove(&task.id) {
                Some(step) => {
                    let wait = (now - step.started_at).num_seconds().max(0);
                    let limit = self.step_timeout(&task, &step.node_id).await;
                    MonitorEntry {
                        current_step_id: Some(step.id),
                        current_step: Some(step.label),
                        current_assignee: step.assigned_to,
                        wait_seconds: Some(wait),
                        overdue: task.status == TaskStatus::Running && (wait as u64) > limit.as_secs(),
                        task,
                    }
                }
                None => MonitorEntry {
                    task,
                    current_step_id: None,
                    current_step: None,
                    current_assignee: None,
                    wait_seconds: None,
                    overdue: false,
                },
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Wait until the task has no queued messages and no running step, or
    /// until `timeout` passes, then return its state.
    pub async fn wait_until_settled(&self, task_id: i64, timeout: Duration) -> Result<Task, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.core.mailbox.is_idle(&task_id) {
                let steps = self.load_steps(task_id).await?;
                if steps.iter().all(|s| s.status != StepStatus::Running) {
                    return self.load_task(task_id).await;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(task_id, "task did not settle within {:?}", timeout);
                return self.load_task(task_id).await;
            }
            tokio::time::sleep(self.core.config.settle_poll_interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Mailbox plumbing
    // -----------------------------------------------------------------------

    fn enqueue(&self, task_id: i64, command: TaskCommand) {
        self.core.mailbox.push(task_id, command, Arc::new(Worker(self.clone())));
    }

    async fn request<T>(
        &self,
        task_id: i64,
        make: impl FnOnce(Reply<T>) -> TaskCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(task_id, make(tx));
        rx.await.map_err(|_| EngineError::EngineUnavailable)?
    }

    // -----------------------------------------------------------------------
    // Loading helpers
    // -----------------------------------------------------------------------

    async fn load_task(&self, task_id: i64) -> Result<Task, EngineError> {
        let row = tasks::get_task(&self.core.pool, task_id).await.map_err(map_task_lookup(task_id))?;
        Task::try_from(row)
    }

    async fn load_steps(&self, task_id: i64) -> Result<Vec<Step>, EngineError> {
        convert_all(steps::list_steps(&self.core.pool, task_id).await?)
    }

    /// A step that must belong to `task_id`.
    async fn load_step(&self, task_id: i64, step_id: i64) -> Result<Step, EngineError> {
        let not_found = EngineError::StepNotFound { task_id, step_id };
        let row = match steps::get_step(&self.core.pool, step_id).await {
            Ok(row) => row,
            Err(DbError::NotFound) => return Err(not_found),
            Err(e) => return Err(e.into()),
        };
        if row.task_id != task_id {
            return Err(not_found);
        }
        Step::try_from(row)
    }

    async fn dag_for(&self, flow_id: i64, version_no: i64) -> Result<Arc<CompiledDag>, EngineError> {
        let cached = lock(&self.core.dags).get(&(flow_id, version_no)).cloned();
        if let Some(dag) = cached {
            return Ok(dag);
        }

        let row = versions::get_version(&self.core.pool, flow_id, version_no)
            .await
            .map_err(|e| match e {
                DbError::NotFound => EngineError::VersionNotFound { flow_id, version_no },
                other => other.into(),
            })?;
        let version = Version::try_from(row)?;
        let dag = Arc::new(compile(&version.definition())?);
        debug!(flow_id, version_no, "compiled DAG cached");
        lock(&self.core.dags).insert((flow_id, version_no), Arc::clone(&dag));
        Ok(dag)
    }

    async fn step_timeout(&self, task: &Task, node_id: &str) -> Duration {
        let configured = match self.dag_for(task.flow_id, task.version_no).await {
            Ok(dag) => match dag.node(node_id).map(|n| &n.kind) {
                Some(NodeKind::Human(cfg)) => cfg.timeout_hours,
                _ => None,
            },
            Err(e) => {
                warn!(task_id = task.id, "cannot read step timeout: {e}");
                None
            }
        };
        configured
            .filter(|h| h.is_finite() && *h > 0.0)
            .map(|h| Duration::from_secs_f64(h * 3600.0))
            .unwrap_or(self.core.config.human_step_timeout)
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// Launch every ready node, or complete the task when nothing is left.
    async fn advance(&self, task_id: i64) -> Result<(), EngineError> {
        let pool = &self.core.pool;
        let mut task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "scan skipped for finished task");
            return Ok(());
        }
        if task.status == TaskStatus::Pending {
            tasks::mark_task_running(pool, task_id).await?;
            task.status = TaskStatus::Running;
        }

        let dag = self.dag_for(task.flow_id, task.version_no).await?;
        let existing = self.load_steps(task_id).await?;
        let by_node: HashMap<&str, &Step> = existing.iter().map(|s| (s.node_id.as_str(), s)).collect();
        let statuses: HashMap<String, StepStatus> =
            existing.iter().map(|s| (s.node_id.clone(), s.status)).collect();

        let ready = dag.ready_nodes(&statuses);
        debug!(task_id, ready = ready.len(), steps = existing.len(), "scan");

        if ready.is_empty() {
            if dag.is_complete(&statuses) {
                tasks::finish_task(pool, task_id, TaskStatus::Completed.as_str(), None).await?;
                info!(task_id, "task completed");
            }
            return Ok(());
        }

        for node in ready {
            let ctx = LaunchContext {
                flow_id: task.flow_id,
                flow_name: task.flow_name.clone(),
                task_id,
                triggered_by: task.assigned_to.clone(),
                upstream: upstream_outputs(&dag, node, &by_node),
            };
            let prior = by_node.get(node.id.as_str()).map(|s| s.id);

            match self.core.executors.launch(node, &ctx).await {
                Ok(Launch::Invoke(launch)) => {
                    let step_id = self.start_auto_step(task_id, node, prior).await?;
                    self.spawn_tool(
                        ToolContext {
                            flow_id: task.flow_id,
                            task_id,
                            step_id,
                            node_id: node.id.clone(),
                            label: node.label.clone(),
                        },
                        launch,
                    );
                }
                Ok(Launch::AwaitHuman(assignment)) => {
                    let row = steps::insert_step(
                        pool,
                        NewStep {
                            task_id,
                            node_id: node.id.clone(),
                            label: node.label.clone(),
                            kind: StepKind::Human.to_string(),
                            status: StepStatus::Pending.to_string(),
                            assigned_to: Some(assignment.assigned_to.clone()),
                            ai_suggestion: assignment.ai_suggestion.clone(),
                        },
                    )
                    .await?;
                    let step = Step::try_from(row)?;
                    info!(task_id, node = %node.id, assignee = %assignment.assigned_to, "waiting for human decision");
                    log_notification(
                        self.core.dispatcher.human_step(&task, &step, &assignment.instructions).await,
                    );
                }
                Err(e @ EngineError::UnknownTool { .. }) => {
                    let step_id = self.start_auto_step(task_id, node, prior).await?;
                    let message = e.to_string();
                    steps::finish_running_step(pool, step_id, StepStatus::Failed.as_str(), &json!({ "error": message }))
                        .await?;
                    let step = self.load_step(task_id, step_id).await?;
                    self.fail_task(&task, Some(&step), message).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn start_auto_step(&self, task_id: i64, node: &NodeSpec, prior: Option<i64>) -> Result<i64, EngineError> {
        let pool = &self.core.pool;
        match prior {
            Some(step_id) => {
                steps::mark_step_running(pool, step_id).await?;
                Ok(step_id)
            }
            None => {
                let row = steps::insert_step(
                    pool,
                    NewStep {
                        task_id,
                        node_id: node.id.clone(),
                        label: node.label.clone(),
                        kind: StepKind::Auto.to_string(),
                        status: StepStatus::Running.to_string(),
                        assigned_to: None,
                        ai_suggestion: None,
                    },
                )
                .await?;
                Ok(row.id)
            }
        }
    }

    /// Run the tool on its own tokio task and post the outcome back to the
    /// task's mailbox.
    fn spawn_tool(&self, ctx: ToolContext, launch: ToolLaunch) {
        let ToolLaunch { tool_name, tool, params } = launch;
        info!(task_id = ctx.task_id, node = %ctx.node_id, tool = %tool_name, "tool started");

        let engine = self.clone();
        tokio::spawn(async move {
            let call_ctx = ctx.clone();
            let invocation = tokio::spawn(async move { tool.invoke(params, &call_ctx).await });
            let result = match invocation.await {
                Ok(result) => result,
                Err(e) => Err(ToolError::Failed(format!("tool '{tool_name}' aborted: {e}"))),
            };
            engine.enqueue(
                ctx.task_id,
                TaskCommand::ToolFinished(ToolDone { step_id: ctx.step_id, node_id: ctx.node_id, result }),
            );
        });
    }

    async fn on_tool_finished(&self, task_id: i64, done: ToolDone) -> Result<(), EngineError> {
        let pool = &self.core.pool;
        let (status, output) = match &done.result {
            Ok(v) => (StepStatus::Completed, v.clone()),
            Err(e) => (StepStatus::Failed, json!({ "error": e.to_string(), "kind": e.kind() })),
        };

        // A task has at most one failed step: failures that land after the
        // task ended leave their step pending.
        let task = self.load_task(task_id).await?;
        let recorded = if task.status.is_terminal() && status == StepStatus::Failed {
            steps::abandon_running_step(pool, done.step_id, &output).await
        } else {
            steps::finish_running_step(pool, done.step_id, status.as_str(), &output).await
        };
        match recorded {
            Ok(()) => {}
            Err(DbError::NotFound) => {
                debug!(task_id, step_id = done.step_id, "stale tool result ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if task.status.is_terminal() {
            info!(task_id, node = %done.node_id, status = %status, "late tool result recorded on {} task", task.status);
            return Ok(());
        }

        match done.result {
            Ok(_) => {
                info!(task_id, node = %done.node_id, "step completed");
                self.advance(task_id).await
            }
            Err(e) => {
                let step = self.load_step(task_id, done.step_id).await?;
                let reason = EngineError::ToolExecution { node_id: done.node_id, message: e.to_string() };
                self.fail_task(&task, Some(&step), reason.to_string()).await
            }
        }
    }

    async fn fail_task(&self, task: &Task, step: Option<&Step>, reason: String) -> Result<(), EngineError> {
        tasks::finish_task(&self.core.pool, task.id, TaskStatus::Failed.as_str(), Some(&reason)).await?;
        error!(task_id = task.id, "task failed: {reason}");
        let failed = Task { status: TaskStatus::Failed, reason: Some(reason.clone()), ..task.clone() };
        log_notification(self.core.dispatcher.alert(&failed, step, &reason).await);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    async fn apply_submit(&self, task_id: i64, step_id: i64, submission: Submission) -> Result<Step, EngineError> {
        let task = self.load_task(task_id).await?;
        let step = self.load_step(task_id, step_id).await?;
        if step.kind != StepKind::Human {
            return Err(EngineError::InvalidSubmission(format!(
                "step {step_id} is automatic and cannot be decided by hand"
            )));
        }
        if !matches!(step.status, StepStatus::Pending | StepStatus::Running) {
            return Err(EngineError::StepNotPending { step_id, status: step.status });
        }
        if task.status.is_terminal() {
            return Err(EngineError::TaskNotActive { task_id, status: task.status });
        }

        let Submission { decision, output, reason, actor } = submission;
        let record = match decision {
            Decision::Approved => StepDecision {
                status: StepStatus::Approved.to_string(),
                decision: Decision::Approved.to_string(),
                output: output.or_else(|| step.ai_suggestion.clone().map(Value::String)),
                reason: reason.clone(),
                decided_by: Some(actor.clone()),
            },
            Decision::Modified => {
                let output = output.filter(|v| !is_blank(v)).ok_or_else(|| {
                    EngineError::InvalidSubmission("a modified decision needs an output".into())
                })?;
                StepDecision {
                    status: StepStatus::Approved.to_string(),
                    decision: Decision::Modified.to_string(),
                    output: Some(output),
                    reason: reason.clone(),
                    decided_by: Some(actor.clone()),
                }
            }
            Decision::Rejected => StepDecision {
                status: StepStatus::Rejected.to_string(),
                decision: Decision::Rejected.to_string(),
                output,
                reason: reason.clone(),
                decided_by: Some(actor.clone()),
            },
        };

        let row = steps::decide_step(&self.core.pool, step_id, &record).await.map_err(|e| match e {
            DbError::NotFound => EngineError::StepNotPending { step_id, status: step.status },
            other => other.into(),
        })?;
        let updated = Step::try_from(row)?;

        if decision == Decision::Rejected {
            let reason = reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| format!("'{}' rejected by {actor}", step.label));
            tasks::finish_task(&self.core.pool, task_id, TaskStatus::Rejected.as_str(), Some(&reason)).await?;
            info!(task_id, step_id, "task rejected: {reason}");
        } else {
            info!(task_id, step_id, decision = %decision, "human step approved");
            self.advance(task_id).await?;
        }
        Ok(updated)
    }

    async fn apply_proxy(&self, task_id: i64, content: String, actor: String) -> Result<Task, EngineError> {
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Rejected {
            return Err(EngineError::TaskNotRejected { task_id, status: task.status });
        }
        let target = self
            .load_steps(task_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Rejected)
            .max_by_key(|s| (s.finished_at, s.id))
            .ok_or_else(|| EngineError::InvalidSubmission("task has no rejected step to take over".into()))?;

        steps::override_rejected_step(
            &self.core.pool,
            target.id,
            &StepDecision {
                status: StepStatus::Approved.to_string(),
                decision: Decision::Approved.to_string(),
                output: Some(Value::String(content)),
                reason: None,
                decided_by: Some(actor.clone()),
            },
        )
        .await?;
        tasks::mark_task_running(&self.core.pool, task_id).await?;
        info!(task_id, step_id = target.id, actor = %actor, "rejected step completed by proxy");

        self.advance(task_id).await?;
        self.load_task(task_id).await
    }

    async fn apply_reset(&self, task_id: i64, step_id: i64) -> Result<Step, EngineError> {
        let task = self.load_task(task_id).await?;
        self.load_step(task_id, step_id).await?;

        let step = Step::try_from(steps::reset_step(&self.core.pool, step_id).await?)?;
        if task.status != TaskStatus::Running {
            tasks::mark_task_running(&self.core.pool, task_id).await?;
        }
        warn!(task_id, step_id, node = %step.node_id, "step reset to pending");

        if step.kind == StepKind::Human {
            let dag = self.dag_for(task.flow_id, task.version_no).await?;
            let instructions = match dag.node(&step.node_id).map(|n| &n.kind) {
                Some(NodeKind::Human(cfg)) => cfg.instructions.clone(),
                _ => String::new(),
            };
            let running = Task { status: TaskStatus::Running, ..task };
            log_notification(self.core.dispatcher.human_step(&running, &step, &instructions).await);
        }

        self.advance(task_id).await?;
        self.load_step(task_id, step_id).await
    }

    async fn apply_terminate(&self, task_id: i64, reason: Option<String>, actor: String) -> Result<Task, EngineError> {
        let task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::TaskNotActive { task_id, status: task.status });
        }
        let reason = match reason.filter(|r| !r.trim().is_empty()) {
            Some(r) => format!("terminated by {actor}: {r}"),
            None => format!("terminated by {actor}"),
        };
        self.fail_task(&task, None, reason).await?;
        self.load_task(task_id).await
    }
}

/// Applies mailbox messages for one task at a time.
struct Worker(TaskEngine);

#[async_trait]
impl MessageHandler<i64, TaskCommand> for Worker {
    async fn handle(&self, task_id: &i64, message: TaskCommand) {
        let engine = &self.0;
        let task_id = *task_id;
        match message {
            TaskCommand::Advance => {
                if let Err(e) = engine.advance(task_id).await {
                    error!(task_id, "scan failed: {e}");
                }
            }
            TaskCommand::ToolFinished(done) => {
                let step_id = done.step_id;
                if let Err(e) = engine.on_tool_finished(task_id, done).await {
                    error!(task_id, step_id, "could not apply tool result: {e}");
                }
            }
            TaskCommand::Submit { step_id, submission, reply } => {
                let _ = reply.send(engine.apply_submit(task_id, step_id, submission).await);
            }
            TaskCommand::Proxy { content, actor, reply } => {
                let _ = reply.send(engine.apply_proxy(task_id, content, actor).await);
            }
            TaskCommand::Reset { step_id, reply } => {
                let _ = reply.send(engine.apply_reset(task_id, step_id).await);
            }
            TaskCommand::Terminate { reason, actor, reply } => {
                let _ = reply.send(engine.apply_terminate(task_id, reason, actor).await);
            }
        }
    }
}

fn upstream_outputs(dag: &CompiledDag, node: &NodeSpec, by_node: &HashMap<&str, &Step>) -> Map<String, Value> {
    dag.predecessors(&node.id)
        .into_iter()
        .filter_map(|p| {
            let output = by_node.get(p.id.as_str())?.output.clone()?;
            Some((p.id.clone(), output))
        })
        .collect()
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
