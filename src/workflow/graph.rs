//! Workflow graph execution.
//!
//! A [`WorkflowGraph`] is a DAG of phase, branch, conditional, parallel and
//! merge nodes. Execution is a depth-first traversal from the entry point
//! with a visited set, so shared downstream nodes run once. Merge points
//! re-enter silently until every awaited dependency has run. Edge
//! conditions gate traversal on the preceding node's outcome.

use super::branch::{run_branch, Branch, BranchDecisionAction, BranchResult};
use super::phase::{execute_phase, Phase, PhaseContext, PhaseResult};
use super::validate::{validate_graph, ValidationReport};
use crate::buffer::StableBuffer;
use crate::error::BoxError;
use futures::future::{join_all, BoxFuture};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Default bound on node executions, against runaway traversal.
pub const DEFAULT_MAX_WORKFLOW_ITERATIONS: usize = 1000;

/// Snapshot handed to conditional evaluators and custom edge conditions.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    pub current_node_id: String,
    pub execution_history: Vec<String>,
    /// Per-node success flags for everything executed so far.
    pub node_success: HashMap<String, bool>,
    pub shared_buffer: Option<StableBuffer>,
}

/// Picks the next node id.
pub type ConditionalFn =
    Arc<dyn Fn(ConditionContext) -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync>;

/// Custom edge predicate.
pub type EdgeEvalFn =
    Arc<dyn Fn(ConditionContext) -> BoxFuture<'static, Result<bool, BoxError>> + Send + Sync>;

/// Edge traversal conditions.
#[derive(Clone)]
pub enum EdgeCondition {
    Always,
    Success,
    Failure,
    Custom(EdgeEvalFn),
}

impl std::fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Success => write!(f, "Success"),
            Self::Failure => write!(f, "Failure"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Directed edge.
#[derive(Debug, Clone)]
pub struct Edge {
    pub to: String,
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn always(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Always }
    }

    pub fn on_success(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Success }
    }

    pub fn on_failure(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Failure }
    }

    pub fn custom(to: impl Into<String>, evaluate: EdgeEvalFn) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Custom(evaluate) }
    }
}

/// Graph node kinds.
#[derive(Clone)]
pub enum WorkflowNode {
    Phase(Phase),
    Branch(Branch),
    Conditional { evaluate: ConditionalFn },
    ParallelGroup { parallel_nodes: Vec<String> },
    MergePoint { wait_for_nodes: Vec<String> },
}

impl std::fmt::Debug for WorkflowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phase(phase) => f.debug_tuple("Phase").field(phase).finish(),
            Self::Branch(branch) => f.debug_tuple("Branch").field(branch).finish(),
            Self::Conditional { .. } => write!(f, "Conditional"),
            Self::ParallelGroup { parallel_nodes } => {
                f.debug_tuple("ParallelGroup").field(parallel_nodes).finish()
            }
            Self::MergePoint { wait_for_nodes } => {
                f.debug_tuple("MergePoint").field(wait_for_nodes).finish()
            }
        }
    }
}

/// The workflow DAG.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    pub nodes: HashMap<String, WorkflowNode>,
    pub edges: HashMap<String, Vec<Edge>>,
    pub entry_point: String,
    pub exit_points: Vec<String>,
}

impl WorkflowGraph {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry_point: entry_point.into(),
            exit_points: Vec::new(),
        }
    }

    pub fn node(mut self, id: impl Into<String>, node: WorkflowNode) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, edge: Edge) -> Self {
        self.edges.entry(from.into()).or_default().push(edge);
        self
    }

    pub fn exit_point(mut self, id: impl Into<String>) -> Self {
        self.exit_points.push(id.into());
        self
    }
}

/// Execution options.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Validate before executing; a failed report aborts.
    pub validate: bool,
    pub stop_on_first_phase_error: bool,
    pub max_workflow_iterations: usize,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            validate: true,
            stop_on_first_phase_error: false,
            max_workflow_iterations: DEFAULT_MAX_WORKFLOW_ITERATIONS,
        }
    }
}

/// Per-node execution record.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Phase(PhaseResult),
    Branch(BranchResult),
    Conditional { next: String },
    Parallel,
    Merge,
}

impl NodeOutcome {
    pub fn success(&self) -> bool {
        match self {
            Self::Phase(result) => result.succeeded(),
            Self::Branch(result) => result.success,
            Self::Conditional { .. } | Self::Parallel | Self::Merge => true,
        }
    }
}

/// Overall traversal result.
#[derive(Debug, Clone, Default)]
pub struct WorkflowResult {
    pub node_results: HashMap<String, NodeOutcome>,
    pub execution_history: Vec<String>,
    pub iterations: usize,
    pub stopped_early: bool,
}

impl WorkflowResult {
    pub fn completed(&self) -> bool {
        !self.stopped_early
    }
}

/// Raised before execution starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow graph failed validation ({} errors)", report.errors.len())]
    Invalid { report: ValidationReport },
}

struct ExecState {
    /// Dispatch dedup: a node is inserted when traversal claims it, which
    /// can be well before its body finishes.
    visited: HashSet<String>,
    /// Nodes whose work has finished and been recorded. Merge points gate
    /// on this set, never on `visited`.
    completed: HashSet<String>,
    results: HashMap<String, NodeOutcome>,
    history: Vec<String>,
    iterations: usize,
    stopped: bool,
}

struct Executor<'a> {
    graph: &'a WorkflowGraph,
    ctx: &'a PhaseContext,
    options: &'a WorkflowOptions,
    state: tokio::sync::Mutex<ExecState>,
}

/// Validate (unless disabled) and execute a workflow graph.
pub async fn execute_workflow_graph(
    graph: &WorkflowGraph,
    ctx: &PhaseContext,
    options: &WorkflowOptions,
) -> Result<WorkflowResult, WorkflowError> {
    if options.validate {
        let report = validate_graph(graph);
        for warning in &report.warnings {
            tracing::warn!(%warning, "workflow graph warning");
        }
        if !report.is_valid() {
            return Err(WorkflowError::Invalid { report });
        }
    }

    let executor = Executor {
        graph,
        ctx,
        options,
        state: tokio::sync::Mutex::new(ExecState {
            visited: HashSet::new(),
            completed: HashSet::new(),
            results: HashMap::new(),
            history: Vec::new(),
            iterations: 0,
            stopped: false,
        }),
    };
    executor.execute_node(graph.entry_point.clone()).await;

    let state = executor.state.into_inner();
    Ok(WorkflowResult {
        node_results: state.results,
        execution_history: state.history,
        iterations: state.iterations,
        stopped_early: state.stopped,
    })
}

impl<'a> Executor<'a> {
    fn execute_node<'s>(&'s self, id: String) -> BoxFuture<'s, ()> {
        Box::pin(async move {
            let Some(node) = self.graph.nodes.get(&id) else {
                tracing::warn!(node = %id, "traversal reached unknown node; skipping");
                return;
            };

            {
                let mut state = self.state.lock().await;
                if state.stopped || state.visited.contains(&id) {
                    return;
                }
                // Merge points wait for every dependency to have finished
                // its work, not merely to have been dispatched; earlier
                // entries return silently and the last dependency to
                // complete re-enters.
                if let WorkflowNode::MergePoint { wait_for_nodes } = node {
                    if !wait_for_nodes.iter().all(|dep| state.completed.contains(dep)) {
                        tracing::debug!(node = %id, "merge point waiting for dependencies");
                        return;
                    }
                }
                if state.iterations >= self.options.max_workflow_iterations {
                    tracing::warn!(
                        limit = self.options.max_workflow_iterations,
                        "workflow iteration limit reached; stopping traversal"
                    );
                    state.stopped = true;
                    return;
                }
                state.iterations += 1;
                state.visited.insert(id.clone());
                state.history.push(id.clone());
            }

            tracing::debug!(node = %id, "executing workflow node");
            match node {
                WorkflowNode::Phase(phase) => {
                    let result = execute_phase(phase, self.ctx).await;
                    let success = result.succeeded();
                    self.record(&id, NodeOutcome::Phase(result)).await;
                    if !success && self.options.stop_on_first_phase_error {
                        self.state.lock().await.stopped = true;
                        return;
                    }
                    self.follow_edges(&id, success).await;
                }
                WorkflowNode::Branch(branch) => {
                    let result = self.run_branch_node(branch).await;
                    let success = result.success;
                    self.record(&id, NodeOutcome::Branch(result)).await;
                    if !success && self.options.stop_on_first_phase_error {
                        self.state.lock().await.stopped = true;
                        return;
                    }
                    self.follow_edges(&id, success).await;
                }
                WorkflowNode::Conditional { evaluate } => {
                    let context = self.condition_context(&id).await;
                    match evaluate(context).await {
                        Ok(next) => {
                            self.record(&id, NodeOutcome::Conditional { next: next.clone() })
                                .await;
                            if self.graph.nodes.contains_key(&next) {
                                self.execute_node(next).await;
                            } else {
                                tracing::warn!(
                                    node = %id,
                                    chosen = %next,
                                    "conditional chose unknown node; stopping this path"
                                );
                            }
                        }
                        Err(error) => {
                            tracing::warn!(node = %id, %error, "conditional evaluator failed");
                        }
                    }
                }
                WorkflowNode::ParallelGroup { parallel_nodes } => {
                    let futures: Vec<_> = parallel_nodes
                        .iter()
                        .map(|child| self.execute_node(child.clone()))
                        .collect();
                    join_all(futures).await;
                    self.record(&id, NodeOutcome::Parallel).await;
                    self.follow_edges(&id, true).await;
                }
                WorkflowNode::MergePoint { .. } => {
                    self.record(&id, NodeOutcome::Merge).await;
                    self.follow_edges(&id, true).await;
                }
            }
        })
    }

    /// A branch node delegates to the branch executor; a terminate decision
    /// from its hook stops the whole traversal.
    async fn run_branch_node(&self, branch: &Branch) -> BranchResult {
        let result =
            run_branch(branch, self.ctx, self.options.stop_on_first_phase_error).await;
        if let Some(hook) = &branch.decision_hook {
            match hook(result.clone()).await {
                Ok(decision) if decision.action == BranchDecisionAction::Terminate => {
                    tracing::info!(branch = %branch.id, "branch decision: terminate workflow");
                    self.state.lock().await.stopped = true;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(branch = %branch.id, %error, "branch decision hook failed");
                }
            }
        }
        result
    }

    async fn follow_edges(&self, id: &str, success: bool) {
        let Some(edges) = self.graph.edges.get(id) else { return };
        for edge in edges {
            if self.state.lock().await.stopped {
                return;
            }
            let pass = match &edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::Success => success,
                EdgeCondition::Failure => !success,
                EdgeCondition::Custom(evaluate) => {
                    let context = self.condition_context(id).await;
                    match evaluate(context).await {
                        Ok(pass) => pass,
                        Err(error) => {
                            tracing::warn!(from = %id, to = %edge.to, %error, "custom edge condition failed; not traversing");
                            false
                        }
                    }
                }
            };
            if pass {
                self.execute_node(edge.to.clone()).await;
            }
        }
    }

    /// Record a node's outcome and mark it completed for merge gating.
    async fn record(&self, id: &str, outcome: NodeOutcome) {
        let mut state = self.state.lock().await;
        state.results.insert(id.to_string(), outcome);
        state.completed.insert(id.to_string());
    }

    async fn condition_context(&self, id: &str) -> ConditionContext {
        let state = self.state.lock().await;
        ConditionContext {
            current_node_id: id.to_string(),
            execution_history: state.history.clone(),
            node_success: state
                .results
                .iter()
                .map(|(node, outcome)| (node.clone(), outcome.success()))
                .collect(),
            shared_buffer: self.ctx.options.shared_buffer.clone(),
        }
    }
}
