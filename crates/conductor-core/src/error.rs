use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor engine.
///
/// Variants map one-to-one onto the failure kinds a host can observe when
/// deploying agents, dispatching tasks or running cross-agent workflows.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A live deployment already exists for this agent name.
    #[error("Agent {0} is already deployed")]
    AlreadyDeployed(String),

    /// No live deployment exists for this agent name.
    #[error("Agent {0} is not deployed")]
    NotDeployed(String),

    /// Deploying another agent would exceed `max_concurrent_agents`.
    #[error("Cannot deploy {agent}: {limit} agents are already deployed")]
    DeploymentLimit {
        /// Agent whose deployment was refused.
        agent: String,
        /// Configured bound on live deployments.
        limit: usize,
    },

    /// The catalog could not produce a valid definition for the agent.
    #[error("Failed to load agent {agent}: {reason}")]
    Load {
        /// Name of the agent that failed to load.
        agent: String,
        /// The missing or invalid field, or the underlying lookup failure.
        reason: String,
    },

    /// The requested task is neither a workflow step nor a prompt of the agent.
    #[error("{task} not found in agent {agent}")]
    TaskNotFound {
        /// Task name that was requested.
        task: String,
        /// Agent the task was dispatched to.
        agent: String,
    },

    /// No scheduling progress is possible: a dependency cycle or a dangling reference.
    #[error("Circular dependency detected among steps: {}", pending.join(", "))]
    CircularDependency {
        /// Keys of the steps that could never become ready.
        pending: Vec<String>,
    },

    /// Failure raised by the tool execution backend.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The per-execution deadline elapsed.
    #[error("Task {task} on agent {agent} timed out after {timeout_ms}ms")]
    Timeout {
        /// Agent the task was dispatched to.
        agent: String,
        /// Task that exceeded its deadline.
        task: String,
        /// Deadline that applied, in milliseconds.
        timeout_ms: u64,
    },

    /// The execution was cancelled before it settled.
    #[error("Task {task} on agent {agent} was cancelled")]
    Cancelled {
        /// Agent the task was dispatched to.
        agent: String,
        /// Task that was cancelled.
        task: String,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Shorthand for a [`ConductorError::Load`] error.
    pub fn load(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}
