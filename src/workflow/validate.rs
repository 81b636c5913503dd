//! Structural validation of workflow graphs.
//!
//! Errors make a graph unexecutable: dangling entry/exit points, edges to
//! missing nodes, malformed nodes, and cycles (the graph must be a DAG).
//! Warnings flag suspicious but runnable shapes: unreachable nodes and
//! orphans.

use super::graph::{Edge, WorkflowGraph, WorkflowNode};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("entry point {0:?} does not exist")]
    MissingEntryPoint(String),
    #[error("exit point {0:?} does not exist")]
    MissingExitPoint(String),
    #[error("edge source {0:?} does not exist")]
    EdgeSourceMissing(String),
    #[error("edge from {from:?} targets missing node {to:?}")]
    EdgeTargetMissing { from: String, to: String },
    #[error("phase node {0:?} has no items")]
    EmptyPhase(String),
    #[error("branch node {0:?} has no phases")]
    EmptyBranch(String),
    #[error("parallel group {node:?} references missing node {target:?}")]
    ParallelTargetMissing { node: String, target: String },
    #[error("merge point {node:?} waits for missing node {target:?}")]
    MergeTargetMissing { node: String, target: String },
    #[error("cycle detected: {path:?}")]
    CycleDetected { path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    Unreachable(String),
    Orphan(String),
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(id) => write!(f, "node {:?} is unreachable from the entry point", id),
            Self::Orphan(id) => write!(f, "node {:?} has no edges and no role", id),
        }
    }
}

/// Outcome of graph validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    /// Every detected cycle as a node path ending where it started.
    pub cycles: Vec<Vec<String>>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate graph structure, node well-formedness, and acyclicity.
pub fn validate_graph(graph: &WorkflowGraph) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !graph.nodes.contains_key(&graph.entry_point) {
        report.errors.push(ValidationError::MissingEntryPoint(graph.entry_point.clone()));
    }
    for exit in &graph.exit_points {
        if !graph.nodes.contains_key(exit) {
            report.errors.push(ValidationError::MissingExitPoint(exit.clone()));
        }
    }

    for (from, edges) in &graph.edges {
        if !graph.nodes.contains_key(from) {
            report.errors.push(ValidationError::EdgeSourceMissing(from.clone()));
        }
        for Edge { to, .. } in edges {
            if !graph.nodes.contains_key(to) {
                report.errors.push(ValidationError::EdgeTargetMissing {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
    }

    for (id, node) in &graph.nodes {
        match node {
            WorkflowNode::Phase(phase) => {
                if phase.items.is_empty() {
                    report.errors.push(ValidationError::EmptyPhase(id.clone()));
                }
            }
            WorkflowNode::Branch(branch) => {
                if branch.phases.is_empty() {
                    report.errors.push(ValidationError::EmptyBranch(id.clone()));
                }
            }
            WorkflowNode::Conditional { .. } => {}
            WorkflowNode::ParallelGroup { parallel_nodes } => {
                for target in parallel_nodes {
                    if !graph.nodes.contains_key(target) {
                        report.errors.push(ValidationError::ParallelTargetMissing {
                            node: id.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
            WorkflowNode::MergePoint { wait_for_nodes } => {
                for target in wait_for_nodes {
                    if !graph.nodes.contains_key(target) {
                        report.errors.push(ValidationError::MergeTargetMissing {
                            node: id.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
    }

    for cycle in find_cycles(graph) {
        report.errors.push(ValidationError::CycleDetected { path: cycle.clone() });
        report.cycles.push(cycle);
    }

    report.warnings = reachability_warnings(graph);
    report
}

/// Forward adjacency used for traversal analysis: edges plus parallel-group
/// fan-out.
fn successors(graph: &WorkflowGraph, id: &str) -> Vec<String> {
    let mut next: Vec<String> = graph
        .edges
        .get(id)
        .map(|edges| edges.iter().map(|e| e.to.clone()).collect())
        .unwrap_or_default();
    if let Some(WorkflowNode::ParallelGroup { parallel_nodes }) = graph.nodes.get(id) {
        next.extend(parallel_nodes.iter().cloned());
    }
    next
}

/// Iterative DFS with an explicit recursion stack; a back edge yields the
/// cycle path from the revisited node.
fn find_cycles(graph: &WorkflowGraph) -> Vec<Vec<String>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut color: HashMap<String, u8> =
        graph.nodes.keys().map(|id| (id.clone(), WHITE)).collect();
    let mut cycles: Vec<Vec<String>> = Vec::new();
    let mut roots: Vec<&String> = graph.nodes.keys().collect();
    roots.sort();

    for root in roots {
        if color.get(root).copied() != Some(WHITE) {
            continue;
        }
        // Stack of (node, next successor index); `path` mirrors the gray
        // chain.
        let mut stack: Vec<(String, usize)> = vec![(root.clone(), 0)];
        let mut path: Vec<String> = vec![root.clone()];
        color.insert(root.clone(), GRAY);

        while let Some((node, index)) = stack.last().cloned() {
            let next = successors(graph, &node);
            if index < next.len() {
                if let Some(entry) = stack.last_mut() {
                    entry.1 += 1;
                }
                let child = &next[index];
                match color.get(child).copied() {
                    Some(WHITE) => {
                        color.insert(child.clone(), GRAY);
                        stack.push((child.clone(), 0));
                        path.push(child.clone());
                    }
                    Some(GRAY) => {
                        // Back edge: slice the path from the first
                        // occurrence of the revisited node.
                        if let Some(start) = path.iter().position(|n| n == child) {
                            let mut cycle: Vec<String> = path[start..].to_vec();
                            cycle.push(child.clone());
                            if !cycles.contains(&cycle) {
                                cycles.push(cycle);
                            }
                        }
                    }
                    _ => {}
                }
            } else {
                color.insert(node.clone(), BLACK);
                stack.pop();
                path.pop();
            }
        }
    }
    cycles
}

/// BFS from the entry following edges, parallel fan-out and merge
/// dependencies; anything unvisited is unreachable, and nodes with no edges
/// and no role at all are orphans.
fn reachability_warnings(graph: &WorkflowGraph) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();

    if graph.nodes.contains_key(&graph.entry_point) {
        visited.insert(graph.entry_point.clone());
        queue.push_back(graph.entry_point.clone());
    }
    while let Some(id) = queue.pop_front() {
        let mut next = successors(graph, &id);
        if let Some(WorkflowNode::MergePoint { wait_for_nodes }) = graph.nodes.get(&id) {
            next.extend(wait_for_nodes.iter().cloned());
        }
        for child in next {
            if graph.nodes.contains_key(&child) && visited.insert(child.clone()) {
                queue.push_back(child);
            }
        }
    }

    let mut referenced: HashSet<&String> = HashSet::new();
    for edges in graph.edges.values() {
        for edge in edges {
            referenced.insert(&edge.to);
        }
    }
    for node in graph.nodes.values() {
        match node {
            WorkflowNode::ParallelGroup { parallel_nodes } => {
                referenced.extend(parallel_nodes.iter())
            }
            WorkflowNode::MergePoint { wait_for_nodes } => {
                referenced.extend(wait_for_nodes.iter())
            }
            _ => {}
        }
    }

    let mut ids: Vec<&String> = graph.nodes.keys().collect();
    ids.sort();
    for id in ids {
        if !visited.contains(id) {
            warnings.push(ValidationWarning::Unreachable(id.clone()));
            let has_out = graph.edges.get(id).map(|e| !e.is_empty()).unwrap_or(false);
            let has_in = referenced.contains(id);
            let is_terminal =
                *id == graph.entry_point || graph.exit_points.contains(id);
            if !has_out && !has_in && !is_terminal {
                warnings.push(ValidationWarning::Orphan(id.clone()));
            }
        }
    }
    warnings
}
