//! DAG validation and compilation: run this before persisting or executing
//! a flow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the flow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. At least one node has no incoming edge.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! [`validate_definition`] accepts an empty draft; [`compile`] additionally
//! requires at least one node and produces the [`CompiledDag`] the task
//! engine schedules from.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::FlowValidationError;
use crate::models::{EdgeSpec, FlowDefinition, NodeKind, NodeSpec, StepStatus};

/// Validate a flow definition and return node IDs in topological order.
///
/// # Errors
/// - [`FlowValidationError::DuplicateNodeId`] if two nodes share an ID.
/// - [`FlowValidationError::UnknownNodeReference`] if an edge references a missing node.
/// - [`FlowValidationError::NoEntryNode`] if every node has an incoming edge.
/// - [`FlowValidationError::CycleDetected`] if the graph is not acyclic.
pub fn validate_definition(def: &FlowDefinition) -> Result<Vec<String>, FlowValidationError> {
    if def.nodes.is_empty() {
        return Ok(Vec::new());
    }
    let dag = compile(def)?;
    Ok(dag.topological_order().map(str::to_owned).collect())
}

/// Compile a definition into an executable graph.
pub fn compile(def: &FlowDefinition) -> Result<CompiledDag, FlowValidationError> {
    if def.nodes.is_empty() {
        return Err(FlowValidationError::EmptyFlow);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut index: HashMap<String, usize> = HashMap::with_capacity(def.nodes.len());
    for (i, node) in def.nodes.iter().enumerate() {
        if index.insert(node.id.clone(), i).is_some() {
            return Err(FlowValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints, dropping exact duplicates
    // -----------------------------------------------------------------------
    let n = def.nodes.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut edges = Vec::with_capacity(def.edges.len());

    for edge in &def.edges {
        let from = *index.get(&edge.source).ok_or_else(|| {
            FlowValidationError::UnknownNodeReference { node_id: edge.source.clone(), side: "source" }
        })?;
        let to = *index.get(&edge.target).ok_or_else(|| {
            FlowValidationError::UnknownNodeReference { node_id: edge.target.clone(), side: "target" }
        })?;
        if seen.insert((from, to)) {
            successors[from].push(to);
            predecessors[to].push(from);
            edges.push(edge.clone());
        }
    }

    let indegree: Vec<usize> = predecessors.iter().map(Vec::len).collect();

    // -----------------------------------------------------------------------
    // 3. Entry nodes
    // -----------------------------------------------------------------------
    if indegree.iter().all(|&d| d > 0) {
        return Err(FlowValidationError::NoEntryNode);
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm), seeded in input order so the
    //    result is deterministic.
    // -----------------------------------------------------------------------
    let mut remaining = indegree.clone();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(n);

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &successors[i] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if order.len() != n {
        return Err(FlowValidationError::CycleDetected);
    }

    Ok(CompiledDag {
        nodes: def.nodes.clone(),
        edges,
        index,
        successors,
        predecessors,
        indegree,
        order,
    })
}

/// A validated flow graph: node arena plus adjacency, computed once per
/// flow version.
#[derive(Debug, Clone)]
pub struct CompiledDag {
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
    index: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    order: Vec<usize>,
}

impl CompiledDag {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Edges with duplicates removed.
    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn indegree(&self, id: &str) -> Option<usize> {
        self.index.get(id).map(|&i| self.indegree[i])
    }

    pub fn has_human_step(&self) -> bool {
        self.nodes.iter().any(NodeSpec::is_human)
    }

    /// Node IDs in topological order.
    pub fn topological_order(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(|&i| self.nodes[i].id.as_str())
    }

    /// Nodes with no incoming edge.
    pub fn entry_nodes(&self) -> Vec<&NodeSpec> {
        self.order
            .iter()
            .filter(|&&i| self.indegree[i] == 0)
            .map(|&i| &self.nodes[i])
            .collect()
    }

    pub fn predecessors(&self, id: &str) -> Vec<&NodeSpec> {
        self.index
            .get(id)
            .map(|&i| self.predecessors[i].iter().map(|&p| &self.nodes[p]).collect())
            .unwrap_or_default()
    }

    pub fn successors(&self, id: &str) -> Vec<&NodeSpec> {
        self.index
            .get(id)
            .map(|&i| self.successors[i].iter().map(|&s| &self.nodes[s]).collect())
            .unwrap_or_default()
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut stack = self.successors[start].clone();
        while let Some(i) = stack.pop() {
            if out.insert(self.nodes[i].id.clone()) {
                stack.extend(self.successors[i].iter().copied());
            }
        }
        out
    }

    /// Nodes that should be launched now, in topological order.
    ///
    /// `steps` maps node ID to the status of that node's step. A node is
    /// ready when every predecessor succeeded and it either has no step yet
    /// or has a `pending` automatic step that was never attempted.
    pub fn ready_nodes(&self, steps: &HashMap<String, StepStatus>) -> Vec<&NodeSpec> {
        self.order
            .iter()
            .filter(|&&i| {
                let node = &self.nodes[i];
                let launchable = match steps.get(&node.id) {
                    None => true,
                    Some(StepStatus::Pending) => matches!(node.kind, NodeKind::Auto(_)),
                    Some(_) => false,
                };
                launchable
                    && self.predecessors[i].iter().all(|&p| {
                        steps.get(&self.nodes[p].id).is_some_and(StepStatus::is_success)
                    })
            })
            .map(|&i| &self.nodes[i])
            .collect()
    }

    /// True when every node has a successful step.
    pub fn is_complete(&self, steps: &HashMap<String, StepStatus>) -> bool {
        self.nodes
            .iter()
            .all(|n| steps.get(&n.id).is_some_and(StepStatus::is_success))
    }
}
