use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Task name that selects an agent's full workflow.
pub const DEFAULT_TASK: &str = "default";

/// Shared context key snapshotted into every execution record.
pub const CURRENT_FEATURE_KEY: &str = "current_feature";

/// Kind of work an agent specializes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Analysis,
    Implementation,
    Infrastructure,
    Review,
    Testing,
    Documentation,
    Security,
    Optimization,
}

impl AgentKind {
    /// Every accepted kind, in declaration order.
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Analysis,
        AgentKind::Implementation,
        AgentKind::Infrastructure,
        AgentKind::Review,
        AgentKind::Testing,
        AgentKind::Documentation,
        AgentKind::Security,
        AgentKind::Optimization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Analysis => "analysis",
            AgentKind::Implementation => "implementation",
            AgentKind::Infrastructure => "infrastructure",
            AgentKind::Review => "review",
            AgentKind::Testing => "testing",
            AgentKind::Documentation => "documentation",
            AgentKind::Security => "security",
            AgentKind::Optimization => "optimization",
        }
    }

    /// Parse a kind from its lowercase name.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared step of an agent's own workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepSpec {
    pub step: String,
    #[serde(default)]
    pub description: String,
    /// Tools this step uses. Empty means "all of the agent's tools".
    #[serde(default)]
    pub tools: Vec<String>,
}

/// An immutable agent definition as loaded from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub workflow: Vec<WorkflowStepSpec>,
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
}

impl AgentDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        kind: AgentKind,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            kind,
            tools: BTreeSet::new(),
            workflow: Vec::new(),
            prompts: BTreeMap::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_step(mut self, step: impl Into<String>, description: impl Into<String>) -> Self {
        self.workflow.push(WorkflowStepSpec {
            step: step.into(),
            description: description.into(),
            tools: Vec::new(),
        });
        self
    }

    pub fn with_prompt(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.prompts.insert(name.into(), template.into());
        self
    }

    pub fn find_step(&self, name: &str) -> Option<&WorkflowStepSpec> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Tools a step runs with: its own list, or the agent's tools when it declares none.
    pub fn step_tools(&self, step: &WorkflowStepSpec) -> Vec<String> {
        if step.tools.is_empty() {
            self.tools.iter().cloned().collect()
        } else {
            step.tools.clone()
        }
    }

    /// Resolve a requested task name against this agent.
    ///
    /// Steps shadow prompts of the same name.
    pub fn resolve_task(&self, task: Option<&str>) -> ConductorResult<TaskRef> {
        match task {
            None | Some(DEFAULT_TASK) => Ok(TaskRef::FullWorkflow),
            Some(name) if self.find_step(name).is_some() => Ok(TaskRef::Step(name.to_string())),
            Some(name) if self.prompts.contains_key(name) => {
                Ok(TaskRef::Prompt(name.to_string()))
            }
            Some(name) => Err(ConductorError::TaskNotFound {
                task: name.to_string(),
                agent: self.name.clone(),
            }),
        }
    }
}

/// A task name resolved against a specific agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    /// Run every declared workflow step in order.
    FullWorkflow,
    /// Run a single named workflow step.
    Step(String),
    /// Run a named prompt.
    Prompt(String),
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Full-workflow runs only: record step failures and keep going.
    #[serde(default, rename = "continueOnError", alias = "continue_on_error")]
    pub continue_on_error: bool,
    /// Deadline for this dispatch; falls back to the configured default.
    #[serde(default, rename = "timeoutMs", alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Opaque options forwarded to the tool backend.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExecuteOptions {
    pub fn continue_on_error() -> Self {
        Self {
            continue_on_error: true,
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Deployed,
}

/// A live agent in the deployment registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub agent: AgentDefinition,
    pub options: serde_json::Value,
    pub deployed_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub execution_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(agent: AgentDefinition, options: serde_json::Value) -> Self {
        Self {
            agent,
            options,
            deployed_at: Utc::now(),
            status: DeploymentStatus::Deployed,
            execution_count: 0,
            last_execution: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One recorded run of a task against a deployed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub agent_name: String,
    pub task: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub context_snapshot: Option<serde_json::Value>,
}

impl Execution {
    pub fn start(
        agent_name: impl Into<String>,
        task: impl Into<String>,
        input: serde_json::Value,
        context_snapshot: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            task: task.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            success: None,
            input,
            output: None,
            error: None,
            context_snapshot,
        }
    }

    /// Transition to `completed`. No-op once terminal.
    pub fn complete(&mut self, output: serde_json::Value) {
        if self.finish(true) {
            self.output = Some(output);
        }
    }

    /// Transition to `failed`. No-op once terminal.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.finish(false) {
            self.error = Some(error.into());
        }
    }

    fn finish(&mut self, success: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.success = Some(success);
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        true
    }
}

/// `depends_on` as written: a single key or a list of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    One(String),
    Many(Vec<String>),
}

/// A step of a cross-agent workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossAgentStep {
    #[serde(default)]
    pub id: Option<String>,
    pub agent: String,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub options: ExecuteOptions,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
}

fn default_task() -> String {
    DEFAULT_TASK.to_string()
}

impl CrossAgentStep {
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: None,
            agent: agent.into(),
            task: task.into(),
            input: serde_json::Value::Null,
            options: ExecuteOptions::default(),
            depends_on: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(DependsOn::Many(deps.into_iter().map(Into::into).collect()));
        self
    }

    /// Key the step is tracked and reported under: its id, else `<agent>_<task>`.
    pub fn key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}_{}", self.agent, self.task),
        }
    }

    /// Dependency keys normalized to a set.
    pub fn dependencies(&self) -> BTreeSet<String> {
        match &self.depends_on {
            None => BTreeSet::new(),
            Some(DependsOn::One(dep)) => BTreeSet::from([dep.clone()]),
            Some(DependsOn::Many(deps)) => deps.iter().cloned().collect(),
        }
    }
}

/// What a cross-agent run does when one of its steps fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failed step fails the whole run once its batch settles.
    #[default]
    FailFast,
    /// Failed steps record `{"error": ..}` and dependents still run.
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
}

/// A cross-agent workflow run and its accumulated results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub steps: Vec<CrossAgentStep>,
    /// Step keys per scheduling layer, once planned.
    pub batches: Vec<Vec<String>>,
    pub status: WorkflowStatus,
    pub failure_policy: FailurePolicy,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(steps: Vec<CrossAgentStep>, failure_policy: FailurePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            steps,
            batches: Vec::new(),
            status: WorkflowStatus::Created,
            failure_policy,
            started_at: None,
            completed_at: None,
            results: serde_json::Map::new(),
            failed_steps: Vec::new(),
            error: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Rolling per-agent execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub avg_duration_ms: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

impl AgentStats {
    /// Fold one settled execution into the counters.
    pub fn record(&mut self, success: bool, duration_ms: u64, at: DateTime<Utc>) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        let n = self.total_executions as f64;
        self.avg_duration_ms += (duration_ms as f64 - self.avg_duration_ms) / n;
        self.last_execution = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentActivity {
    Active,
    Inactive,
}

/// Answer to a status query for one agent name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub name: String,
    pub status: AgentActivity,
    pub deployment: Option<Deployment>,
    pub statistics: AgentStats,
}

/// A catalog entry annotated with whether it is currently deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub definition: AgentDefinition,
    pub status: AgentActivity,
}
