//! Flow creation and lookup.

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, instrument};

use db::models::NewFlow;
use db::repository::{flows, versions};
use db::{DbError, DbPool};

use crate::cron::CronExpr;
use crate::dag::validate_definition;
use crate::error::EngineError;
use crate::models::{convert_all, Flow, FlowDetail, FlowInput, TriggerType, Version};

/// Flow header plus the next local time the scheduler will start it.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    #[serde(flatten)]
    pub flow: Flow,
    pub next_run_at: Option<DateTime<Local>>,
}

#[derive(Clone)]
pub struct FlowStore {
    pool: DbPool,
}

impl FlowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a flow and its version 1.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create(&self, input: FlowInput) -> Result<FlowDetail, EngineError> {
        let input = validate_input(input)?;
        let (row, version) = flows::create_flow(
            &self.pool,
            NewFlow {
                name: input.name.clone(),
                trigger_type: input.trigger_type.to_string(),
                trigger_config: input.trigger_config.clone(),
                nodes: input.definition.nodes_json()?,
                edges: input.definition.edges_json()?,
            },
        )
        .await?;
        info!(flow_id = row.id, nodes = input.definition.nodes.len(), "flow created");

        let version = Version::try_from(version)?;
        Ok(FlowDetail { flow: Flow::try_from(row)?, nodes: version.nodes, edges: version.edges })
    }

    /// A flow with the graph of its current version.
    pub async fn get(&self, flow_id: i64) -> Result<FlowDetail, EngineError> {
        let flow = self.header(flow_id).await?;
        let row = versions::get_version(&self.pool, flow_id, flow.current_version)
            .await
            .map_err(|e| match e {
                DbError::NotFound => EngineError::VersionNotFound { flow_id, version_no: flow.current_version },
                other => other.into(),
            })?;
        let version = Version::try_from(row)?;
        Ok(FlowDetail { flow, nodes: version.nodes, edges: version.edges })
    }

    pub async fn header(&self, flow_id: i64) -> Result<Flow, EngineError> {
        let row = flows::get_flow(&self.pool, flow_id).await.map_err(|e| match e {
            DbError::NotFound => EngineError::FlowNotFound(flow_id),
            other => other.into(),
        })?;
        Flow::try_from(row)
    }

    /// All flows, newest first.
    pub async fn list(&self) -> Result<Vec<FlowSummary>, EngineError> {
        let now = Local::now().naive_local();
        let all: Vec<Flow> = convert_all(flows::list_flows(&self.pool).await?)?;
        Ok(all
            .into_iter()
            .map(|flow| {
                let next_run_at = scheduled_expression(&flow)
                    .and_then(|expr| expr.next_after(&now))
                    .and_then(|t| t.and_local_timezone(Local).earliest());
                FlowSummary { flow, next_run_at }
            })
            .collect())
    }
}

/// The parsed cron expression of a flow the scheduler should run.
pub(crate) fn scheduled_expression(flow: &Flow) -> Option<CronExpr> {
    if flow.trigger_type != TriggerType::Cron {
        return None;
    }
    CronExpr::parse(flow.trigger_config.as_deref()?).ok()
}

/// Check a flow input before it is stored: a name, a usable trigger and a
/// structurally valid (possibly empty) graph. Blank trigger configs are
/// normalised to `None`.
pub fn validate_input(mut input: FlowInput) -> Result<FlowInput, EngineError> {
    input.name = input.name.trim().to_string();
    if input.name.is_empty() {
        return Err(EngineError::InvalidSubmission("flow name must not be empty".into()));
    }
    input.trigger_config = input
        .trigger_config
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    validate_trigger(input.trigger_type, input.trigger_config.as_deref())?;
    validate_definition(&input.definition)?;
    Ok(input)
}

/// Cron flows must carry a parseable expression or none at all (which
/// keeps them out of the scheduler).
pub fn validate_trigger(trigger_type: TriggerType, config: Option<&str>) -> Result<(), EngineError> {
    if let (TriggerType::Cron, Some(expr)) = (trigger_type, config) {
        CronExpr::parse(expr).map_err(|e| EngineError::InvalidTrigger(format!("'{expr}': {e}")))?;
    }
    Ok(())
}
