//! Branch workflows: ordered or parallel sequences of phases with decision
//! hooks.
//!
//! Branches marked parallel all start together and are awaited as a set;
//! the remaining branches run serially in declaration order. After each
//! branch a decision hook may terminate the workflow or jump forward to a
//! strictly later serial branch. Backward or unknown jump targets are
//! counted, logged and otherwise ignored.

use super::phase::{execute_phase, Phase, PhaseContext, PhaseResult};
use crate::error::BoxError;
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use std::sync::Arc;

/// Decision returned by a branch hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchDecisionAction {
    Continue,
    Terminate,
    Jump,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchDecision {
    pub action: BranchDecisionAction,
    pub target_branch_id: Option<String>,
    pub metadata: Option<Value>,
}

impl BranchDecision {
    pub fn proceed() -> Self {
        Self { action: BranchDecisionAction::Continue, target_branch_id: None, metadata: None }
    }

    pub fn terminate() -> Self {
        Self { action: BranchDecisionAction::Terminate, target_branch_id: None, metadata: None }
    }

    pub fn jump(target: impl Into<String>) -> Self {
        Self {
            action: BranchDecisionAction::Jump,
            target_branch_id: Some(target.into()),
            metadata: None,
        }
    }
}

/// Hook consulted after a branch completes.
pub type BranchDecisionHook = Arc<
    dyn Fn(BranchResult) -> BoxFuture<'static, Result<BranchDecision, BoxError>> + Send + Sync,
>;

/// One branch: an ordered list of phases.
#[derive(Clone)]
pub struct Branch {
    pub id: String,
    pub phases: Vec<Phase>,
    /// Run alongside the other parallel branches instead of serially.
    pub execute_in_parallel: bool,
    pub decision_hook: Option<BranchDecisionHook>,
}

impl Branch {
    pub fn new(id: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self { id: id.into(), phases, execute_in_parallel: false, decision_hook: None }
    }

    pub fn parallel(mut self) -> Self {
        self.execute_in_parallel = true;
        self
    }

    pub fn with_decision_hook(mut self, hook: BranchDecisionHook) -> Self {
        self.decision_hook = Some(hook);
        self
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("phases", &self.phases.len())
            .field("execute_in_parallel", &self.execute_in_parallel)
            .finish()
    }
}

/// Outcome of one branch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchResult {
    pub branch_id: String,
    pub phase_results: Vec<PhaseResult>,
    pub success: bool,
    /// Set when `stop_on_first_phase_error` cut the branch short.
    pub stopped_early: bool,
}

/// A branch workflow: the full set of branches plus workflow-level policy.
#[derive(Clone, Default)]
pub struct BranchWorkflow {
    pub branches: Vec<Branch>,
    pub stop_on_first_phase_error: bool,
}

/// Outcome of a branch workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchWorkflowResult {
    pub branch_results: Vec<BranchResult>,
    pub terminated_early: bool,
    /// Jumps ignored because their target was backward or unknown.
    pub rejected_jumps: u64,
}

/// Execute all branches: parallel set first, then the serial chain.
pub async fn execute_branch_workflow(
    workflow: &BranchWorkflow,
    ctx: &PhaseContext,
) -> BranchWorkflowResult {
    let mut result = BranchWorkflowResult {
        branch_results: Vec::new(),
        terminated_early: false,
        rejected_jumps: 0,
    };

    let parallel: Vec<&Branch> =
        workflow.branches.iter().filter(|b| b.execute_in_parallel).collect();
    let serial: Vec<&Branch> =
        workflow.branches.iter().filter(|b| !b.execute_in_parallel).collect();

    if !parallel.is_empty() {
        let futures: Vec<_> = parallel
            .iter()
            .map(|&branch| run_branch(branch, ctx, workflow.stop_on_first_phase_error))
            .collect();
        for branch_result in join_all(futures).await {
            if let Some(branch) =
                parallel.iter().copied().find(|b| b.id == branch_result.branch_id)
            {
                match decide(branch, &branch_result).await {
                    Some(BranchDecision { action: BranchDecisionAction::Terminate, .. }) => {
                        result.terminated_early = true;
                    }
                    Some(BranchDecision { action: BranchDecisionAction::Jump, .. }) => {
                        tracing::warn!(
                            branch = %branch_result.branch_id,
                            "jump from a parallel branch is not supported; ignoring"
                        );
                        result.rejected_jumps += 1;
                    }
                    _ => {}
                }
            }
            let failed = !branch_result.success;
            result.branch_results.push(branch_result);
            if failed && workflow.stop_on_first_phase_error {
                result.terminated_early = true;
            }
        }
        if result.terminated_early {
            return result;
        }
    }

    let mut branch_index = 0;
    while branch_index < serial.len() {
        let branch = serial[branch_index];
        let branch_result = run_branch(branch, ctx, workflow.stop_on_first_phase_error).await;
        let failed = !branch_result.success;
        let decision = decide(branch, &branch_result).await;
        result.branch_results.push(branch_result);

        if failed && workflow.stop_on_first_phase_error {
            result.terminated_early = true;
            break;
        }

        match decision {
            Some(BranchDecision { action: BranchDecisionAction::Terminate, .. }) => {
                tracing::info!(branch = %branch.id, "branch decision: terminate");
                result.terminated_early = true;
                break;
            }
            Some(BranchDecision {
                action: BranchDecisionAction::Jump,
                target_branch_id: Some(target),
                ..
            }) => {
                // Only strictly later serial branches are legal targets.
                match serial.iter().position(|b| b.id == target) {
                    Some(target_index) if target_index > branch_index => {
                        tracing::info!(
                            branch = %branch.id,
                            target = %target,
                            "branch decision: jump"
                        );
                        branch_index = target_index;
                        continue;
                    }
                    _ => {
                        tracing::warn!(
                            branch = %branch.id,
                            target = %target,
                            "illegal jump target; continuing sequentially"
                        );
                        result.rejected_jumps += 1;
                    }
                }
            }
            Some(BranchDecision { action: BranchDecisionAction::Jump, .. }) => {
                tracing::warn!(branch = %branch.id, "jump without target; continuing");
                result.rejected_jumps += 1;
            }
            _ => {}
        }
        branch_index += 1;
    }

    result
}

/// Run one branch: its phases, in order.
pub(crate) async fn run_branch(
    branch: &Branch,
    ctx: &PhaseContext,
    stop_on_first_phase_error: bool,
) -> BranchResult {
    let mut phase_results = Vec::with_capacity(branch.phases.len());
    let mut stopped_early = false;

    for phase in &branch.phases {
        let phase_result = execute_phase(phase, ctx).await;
        let failed = !phase_result.succeeded();
        phase_results.push(phase_result);
        if failed && stop_on_first_phase_error {
            tracing::info!(branch = %branch.id, "stopping branch on phase failure");
            stopped_early = true;
            break;
        }
    }

    let success = phase_results.iter().all(|r| r.succeeded()) && !stopped_early;
    BranchResult { branch_id: branch.id.clone(), phase_results, success, stopped_early }
}

async fn decide(branch: &Branch, result: &BranchResult) -> Option<BranchDecision> {
    let hook = branch.decision_hook.as_ref()?;
    match hook(result.clone()).await {
        Ok(decision) => Some(decision),
        Err(error) => {
            tracing::warn!(branch = %branch.id, %error, "branch decision hook failed; continuing");
            None
        }
    }
}
