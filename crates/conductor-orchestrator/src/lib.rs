//! Agent deployment, task dispatch, and cross-agent workflow scheduling.
//!
//! Agents are loaded from a catalog, deployed into a live pool, and run through
//! a pluggable tool backend. Cross-agent workflows are partitioned into
//! dependency batches that execute concurrently, one batch at a time.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Facade owning all engine state; the entry point for hosts.
//! - [`AgentCatalog`]: Source of agent definitions ([`DirectoryCatalog`], [`InMemoryCatalog`]).
//! - [`DeploymentRegistry`]: Live deployments, one per name, bounded by `max_concurrent_agents`.
//! - [`Dispatcher`]: Resolves and runs tasks under deadlines and cancellation.
//! - [`WorkflowScheduler`]: Topological batching and batch-by-batch execution.
//! - [`StatsRecorder`]: Execution history and per-agent counters.
//! - [`ToolBackend`]: The capability that actually performs agent work.

/// Tool backend trait and the dry-run backend.
pub mod backend;
/// Agent definition sources and validation.
pub mod catalog;
/// TOML configuration.
pub mod config;
/// Shared key/value context.
pub mod context;
/// Task resolution and execution.
pub mod dispatcher;
/// The orchestrator facade.
pub mod engine;
/// Agent-to-agent request/callback relay.
pub mod messaging;
/// Execution and workflow recorders.
pub mod recorder;
/// Deployment registry.
pub mod registry;
/// Shared orchestration types (AgentDefinition, Execution, WorkflowRun, etc.).
pub mod types;
/// Cross-agent workflow planning and execution.
pub mod workflow;

pub use backend::{render_template, DryRunBackend, PromptInvocation, StepInvocation, ToolBackend};
pub use catalog::{validate_definition, AgentCatalog, DirectoryCatalog, InMemoryCatalog};
pub use config::OrchestratorConfig;
pub use context::SharedContext;
pub use dispatcher::Dispatcher;
pub use engine::Orchestrator;
pub use messaging::{AgentMessage, MessageRelay};
pub use recorder::{InMemoryRecorder, JsonlRecorder, StatsRecorder};
pub use registry::DeploymentRegistry;
pub use types::{
    AgentActivity, AgentDefinition, AgentKind, AgentStats, AgentStatusReport, AgentSummary,
    CrossAgentStep, DependsOn, Deployment, DeploymentStatus, ExecuteOptions, Execution,
    ExecutionStatus, FailurePolicy, TaskRef, WorkflowRun, WorkflowStatus, WorkflowStepSpec,
    CURRENT_FEATURE_KEY, DEFAULT_TASK,
};
pub use workflow::{plan_batches, WorkflowScheduler};
