//! Higher-order execution units: phases, branches, and workflow graphs.

pub mod branch;
pub mod graph;
pub mod phase;
pub mod validate;

pub use branch::{
    execute_branch_workflow, Branch, BranchDecision, BranchDecisionAction, BranchDecisionHook,
    BranchResult, BranchWorkflow, BranchWorkflowResult,
};
pub use graph::{
    execute_workflow_graph, ConditionContext, ConditionalFn, Edge, EdgeCondition, EdgeEvalFn,
    NodeOutcome, WorkflowError, WorkflowGraph, WorkflowNode, WorkflowOptions, WorkflowResult,
    DEFAULT_MAX_WORKFLOW_ITERATIONS,
};
pub use phase::{
    execute_phase, Phase, PhaseCompletionHook, PhaseContext, PhaseError, PhaseResult,
};
pub use validate::{validate_graph, ValidationError, ValidationReport, ValidationWarning};
