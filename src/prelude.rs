//! Convenient re-exports for common Stable Gateway types.
pub use crate::{
    distributed::{
        create_distributed_stable_buffer, ConflictResolution, CoordinatorError,
        DistributedBufferOptions, DistributedCoordinator, DistributedScheduler,
        DistributedStableBuffer, ElectionConfig, InMemoryBackplane, InMemoryCoordinator,
        LeaderStatus, LockOptions,
    },
    stable_api_gateway, stable_request,
    workflow::{
        execute_branch_workflow, execute_phase, execute_workflow_graph, validate_graph, Branch,
        BranchDecision, BranchDecisionAction, BranchWorkflow, Edge, EdgeCondition, Phase,
        PhaseContext, PhaseResult, WorkflowGraph, WorkflowNode, WorkflowOptions,
    },
    CacheConfig, CacheManager, CallOutcome, CancelToken, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, ConcurrencyLimiter, GatewayError, GatewayItem, GatewayOptions,
    GatewayResponse, HttpTransport, Jitter, Method, PolicyOverrides, Protocol, RateLimitConfig,
    RateLimiter, Request, RequestError, RequestPolicy, RetryStrategy, StableBuffer,
    StableRequestSpec, TransportError, TransportResponse, TrialConfig,
};
