//! Version manager: save, diff and roll back flow definitions.
//!
//! Versions are append-only. Saving and rolling back both create a new
//! version and point the flow at it; nothing here rewrites history.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, instrument};

use db::models::FlowHeader;
use db::repository::versions;
use db::{DbError, DbPool};

use crate::error::EngineError;
use crate::flows::validate_input;
use crate::models::{convert_all, EdgeSpec, Flow, FlowDetail, FlowInput, NodeSpec, Version};

/// Structural difference between two versions of a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDiff {
    pub flow_id: i64,
    pub from: i64,
    pub to: i64,
    pub added_nodes: Vec<String>,
    pub removed_nodes: Vec<String>,
    /// Nodes present in both whose label, kind or config differ.
    pub changed_nodes: Vec<String>,
    pub added_edges: Vec<EdgeSpec>,
    pub removed_edges: Vec<EdgeSpec>,
}

#[derive(Clone)]
pub struct VersionManager {
    pool: DbPool,
}

impl VersionManager {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Store `input` as the flow's next version and make it current.
    #[instrument(skip(self, input))]
    pub async fn save(&self, flow_id: i64, input: FlowInput) -> Result<FlowDetail, EngineError> {
        let input = validate_input(input)?;
        let header = FlowHeader {
            name: input.name.clone(),
            trigger_type: input.trigger_type.to_string(),
            trigger_config: input.trigger_config.clone(),
        };
        let row = versions::append_version(
            &self.pool,
            flow_id,
            &input.definition.nodes_json()?,
            &input.definition.edges_json()?,
            Some(&header),
        )
        .await
        .map_err(flow_lookup(flow_id))?;
        info!(flow_id, version = row.version_no, "flow version saved");
        self.detail(flow_id, Version::try_from(row)?).await
    }

    /// Every version of the flow, oldest first.
    pub async fn list(&self, flow_id: i64) -> Result<Vec<Version>, EngineError> {
        let rows = versions::list_versions(&self.pool, flow_id).await?;
        if rows.is_empty() {
            return Err(EngineError::FlowNotFound(flow_id));
        }
        convert_all(rows)
    }

    pub async fn get(&self, flow_id: i64, version_no: i64) -> Result<Version, EngineError> {
        let row = versions::get_version(&self.pool, flow_id, version_no)
            .await
            .map_err(|e| match e {
                DbError::NotFound => EngineError::VersionNotFound { flow_id, version_no },
                other => other.into(),
            })?;
        Version::try_from(row)
    }

    pub async fn diff(&self, flow_id: i64, from: i64, to: i64) -> Result<VersionDiff, EngineError> {
        let old = self.get(flow_id, from).await?;
        let new = self.get(flow_id, to).await?;
        Ok(diff_versions(&old, &new))
    }

    /// Copy version `target` into a new current version.
    ///
    /// # Errors
    /// [`EngineError::RollbackTargetNotFound`] when `target` does not exist.
    #[instrument(skip(self))]
    pub async fn rollback(&self, flow_id: i64, target: i64) -> Result<FlowDetail, EngineError> {
        let source = versions::get_version(&self.pool, flow_id, target)
            .await
            .map_err(|e| match e {
                DbError::NotFound => EngineError::RollbackTargetNotFound { flow_id, version_no: target },
                other => other.into(),
            })?;
        let row = versions::append_version(&self.pool, flow_id, &source.nodes, &source.edges, None)
            .await
            .map_err(flow_lookup(flow_id))?;
        info!(flow_id, from = target, version = row.version_no, "flow rolled back");
        self.detail(flow_id, Version::try_from(row)?).await
    }

    async fn detail(&self, flow_id: i64, version: Version) -> Result<FlowDetail, EngineError> {
        let flow = Flow::try_from(db::repository::flows::get_flow(&self.pool, flow_id).await.map_err(flow_lookup(flow_id))?)?;
        Ok(FlowDetail { flow, nodes: version.nodes, edges: version.edges })
    }
}

fn flow_lookup(flow_id: i64) -> impl FnOnce(DbError) -> EngineError {
    move |e| match e {
        DbError::NotFound => EngineError::FlowNotFound(flow_id),
        other => other.into(),
    }
}

/// Compare two versions by node ID and by edge endpoints. Canvas positions
/// are ignored.
pub fn diff_versions(old: &Version, new: &Version) -> VersionDiff {
    let index = |nodes: &[NodeSpec]| -> BTreeMap<String, NodeSpec> {
        nodes.iter().map(|n| (n.id.clone(), n.without_layout())).collect()
    };
    let before = index(&old.nodes);
    let after = index(&new.nodes);

    let added_nodes = after.keys().filter(|id| !before.contains_key(*id)).cloned().collect();
    let removed_nodes = before.keys().filter(|id| !after.contains_key(*id)).cloned().collect();
    let changed_nodes = before
        .iter()
        .filter(|(id, node)| after.get(*id).is_some_and(|other| other != *node))
        .map(|(id, _)| id.clone())
        .collect();

    let old_edges: BTreeSet<&EdgeSpec> = old.edges.iter().collect();
    let new_edges: BTreeSet<&EdgeSpec> = new.edges.iter().collect();

    VersionDiff {
        flow_id: new.flow_id,
        from: old.version_no,
        to: new.version_no,
        added_nodes,
        removed_nodes,
        changed_nodes,
        added_edges: new_edges.difference(&old_edges).map(|e| (*e).clone()).collect(),
        removed_edges: old_edges.difference(&new_edges).map(|e| (*e).clone()).collect(),
    }
}
