use crate::backend::{PromptInvocation, StepInvocation, ToolBackend};
use crate::context::SharedContext;
use crate::recorder::StatsRecorder;
use crate::registry::DeploymentRegistry;
use crate::types::{
    AgentDefinition, ExecuteOptions, Execution, TaskRef, WorkflowStepSpec, DEFAULT_TASK,
};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Event, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Resolves tasks against deployed agents, runs them, and records every
/// execution's lifecycle.
///
/// Failures are always recorded *and* returned; nothing is swallowed here.
pub struct Dispatcher {
    registry: Arc<DeploymentRegistry>,
    recorder: Arc<dyn StatsRecorder>,
    backend: Arc<dyn ToolBackend>,
    context: SharedContext,
    events: EventBus,
    default_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// `default_timeout` applies when a dispatch does not set `timeout_ms`
    /// (`None` disables it).
    pub fn new(
        registry: Arc<DeploymentRegistry>,
        recorder: Arc<dyn StatsRecorder>,
        backend: Arc<dyn ToolBackend>,
        context: SharedContext,
        events: EventBus,
        default_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            recorder,
            backend,
            context,
            events,
            default_timeout,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<dyn StatsRecorder> {
        &self.recorder
    }

    /// Token cancelled when the owning orchestrator shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `task` on `agent_name`, auto-deploying the agent on first use.
    ///
    /// `None` or `"default"` runs the agent's full workflow.
    pub async fn execute(
        &self,
        agent_name: &str,
        task: Option<&str>,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> ConductorResult<serde_json::Value> {
        let cancel = self.shutdown.child_token();
        self.execute_with_cancel(agent_name, task, input, options, &cancel)
            .await
    }

    /// Like [`Dispatcher::execute`], abandoning the work when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        agent_name: &str,
        task: Option<&str>,
        input: serde_json::Value,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ConductorResult<serde_json::Value> {
        let agent = self.registry.ensure_deployed(agent_name).await?;
        let task_name = task.unwrap_or(DEFAULT_TASK);

        let mut execution = Execution::start(
            agent_name,
            task_name,
            input.clone(),
            self.context.current_feature(),
        );
        if let Err(e) = self.recorder.record_execution_start(&execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to record execution start");
        }
        info!(
            execution_id = %execution.id,
            agent = %agent_name,
            task = %task_name,
            "Execution started"
        );
        self.events.emit(Event::ExecutionStarted {
            execution_id: execution.id,
            agent: agent_name.to_string(),
            task: task_name.to_string(),
        });

        let outcome = self
            .run_guarded(&agent, task_name, input, options, cancel)
            .await;

        match outcome {
            Ok(output) => {
                execution.complete(output.clone());
                let at = execution.completed_at.unwrap_or_else(Utc::now);
                if !self.registry.record_execution(agent_name, at).await {
                    warn!(agent = %agent_name, "Agent stopped while its execution was in flight");
                }
                if let Err(e) = self.recorder.record_execution_complete(&execution).await {
                    warn!(execution_id = %execution.id, error = %e, "Failed to record execution");
                }
                let duration_ms = execution.duration_ms.unwrap_or_default();
                info!(
                    execution_id = %execution.id,
                    agent = %agent_name,
                    task = %task_name,
                    duration_ms,
                    "Execution completed"
                );
                self.events.emit(Event::ExecutionCompleted {
                    execution_id: execution.id,
                    agent: agent_name.to_string(),
                    task: task_name.to_string(),
                    duration_ms,
                    output: output.clone(),
                });
                Ok(output)
            }
            Err(e) => {
                execution.fail(e.to_string());
                if let Err(record_err) = self.recorder.record_execution_complete(&execution).await
                {
                    warn!(
                        execution_id = %execution.id,
                        error = %record_err,
                        "Failed to record execution"
                    );
                }
                let duration_ms = execution.duration_ms.unwrap_or_default();
                error!(
                    execution_id = %execution.id,
                    agent = %agent_name,
                    task = %task_name,
                    duration_ms,
                    error = %e,
                    "Execution failed"
                );
                self.events.emit(Event::ExecutionFailed {
                    execution_id: execution.id,
                    agent: agent_name.to_string(),
                    task: task_name.to_string(),
                    duration_ms,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Resolve and run the task under the deadline and the cancellation token.
    ///
    /// No pool slot is taken here, so a backend may dispatch nested work under
    /// its own token without waiting on its caller.
    async fn run_guarded(
        &self,
        agent: &AgentDefinition,
        task_name: &str,
        input: serde_json::Value,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ConductorResult<serde_json::Value> {
        let deadline = options
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout)
            .filter(|d| !d.is_zero());

        let work = async move {
            let task_ref = agent.resolve_task(Some(task_name))?;
            self.run_task(agent, task_ref, input, options, cancel).await
        };

        let bounded = async move {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(ConductorError::Timeout {
                        agent: agent.name.clone(),
                        task: task_name.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConductorError::Cancelled {
                agent: agent.name.clone(),
                task: task_name.to_string(),
            }),
            result = bounded => result,
        }
    }

    async fn run_task(
        &self,
        agent: &AgentDefinition,
        task_ref: TaskRef,
        input: serde_json::Value,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ConductorResult<serde_json::Value> {
        match task_ref {
            TaskRef::FullWorkflow => self.run_full_workflow(agent, input, options, cancel).await,
            TaskRef::Step(name) => {
                let step = agent
                    .find_step(&name)
                    .ok_or_else(|| ConductorError::TaskNotFound {
                        task: name.clone(),
                        agent: agent.name.clone(),
                    })?;
                self.run_step(agent, step, input, options, cancel).await
            }
            TaskRef::Prompt(name) => {
                let template = agent.prompts.get(&name).cloned().ok_or_else(|| {
                    ConductorError::TaskNotFound {
                        task: name.clone(),
                        agent: agent.name.clone(),
                    }
                })?;
                self.backend
                    .run_prompt(PromptInvocation {
                        agent: agent.name.clone(),
                        prompt: name,
                        template,
                        input,
                        options,
                        cancel: cancel.clone(),
                    })
                    .await
            }
        }
    }

    async fn run_step(
        &self,
        agent: &AgentDefinition,
        step: &WorkflowStepSpec,
        input: serde_json::Value,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ConductorResult<serde_json::Value> {
        self.backend
            .run_step(StepInvocation {
                agent: agent.name.clone(),
                step: step.step.clone(),
                description: step.description.clone(),
                tools: agent.step_tools(step),
                input,
                options,
                cancel: cancel.clone(),
            })
            .await
    }

    /// Run every declared step strictly in order.
    ///
    /// Without `continue_on_error` the first failure aborts the run and the
    /// partial results are dropped.
    async fn run_full_workflow(
        &self,
        agent: &AgentDefinition,
        input: serde_json::Value,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> ConductorResult<serde_json::Value> {
        let mut results = serde_json::Map::new();
        let mut completed_steps = 0usize;

        for step in &agent.workflow {
            match self
                .run_step(agent, step, input.clone(), options.clone(), cancel)
                .await
            {
                Ok(output) => {
                    completed_steps += 1;
                    results.insert(step.step.clone(), output);
                }
                Err(e) if options.continue_on_error => {
                    warn!(
                        agent = %agent.name,
                        step = %step.step,
                        error = %e,
                        "Workflow step failed, continuing"
                    );
                    results.insert(
                        step.step.clone(),
                        serde_json::json!({ "error": e.to_string() }),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(serde_json::json!({
            "workflow_results": results,
            "agent": agent.name,
            "completed_steps": completed_steps,
            "total_steps": agent.workflow.len(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::recorder::InMemoryRecorder;
    use crate::types::{AgentKind, ExecutionStatus, CURRENT_FEATURE_KEY};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Fails any step named `explode`, sleeps for `slow`, echoes everything else.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolBackend for ScriptedBackend {
        async fn run_step(&self, inv: StepInvocation) -> ConductorResult<serde_json::Value> {
            self.calls.lock().push(inv.step.clone());
            match inv.step.as_str() {
                "explode" => Err(ConductorError::Execution("step exploded".into())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("slow done"))
                }
                _ => Ok(json!({"step": inv.step, "tools": inv.tools})),
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        recorder: Arc<InMemoryRecorder>,
        backend: Arc<ScriptedBackend>,
        context: SharedContext,
    }

    fn fixture() -> Fixture {
        let agent = AgentDefinition::new("builder", "1.0.0", "Builds", AgentKind::Implementation)
            .with_tools(["cargo"])
            .with_step("fetch", "Fetch sources")
            .with_step("explode", "Always fails")
            .with_step("package", "Package artifacts")
            .with_prompt("plan", "Plan {{feature}}");
        let slow = AgentDefinition::new("sloth", "1.0.0", "Slow", AgentKind::Analysis)
            .with_step("slow", "Takes a while");
        let catalog = Arc::new(InMemoryCatalog::with_agents([agent, slow]).unwrap());
        let events = EventBus::new(64);
        let registry = Arc::new(DeploymentRegistry::new(catalog, 4, events.clone()));
        let recorder = Arc::new(InMemoryRecorder::new());
        let backend = Arc::new(ScriptedBackend::default());
        let context = SharedContext::new(events.clone());
        let dispatcher = Dispatcher::new(
            registry,
            recorder.clone(),
            backend.clone(),
            context.clone(),
            events,
            None,
            CancellationToken::new(),
        );
        Fixture {
            dispatcher,
            recorder,
            backend,
            context,
        }
    }

    #[tokio::test]
    async fn test_auto_deploy_and_step_execution() {
        let f = fixture();
        let output = f
            .dispatcher
            .execute("builder", Some("fetch"), json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(output["step"], "fetch");
        assert_eq!(output["tools"], json!(["cargo"]));

        let deployment = f.dispatcher.registry().get("builder").await.unwrap();
        assert_eq!(deployment.execution_count, 1);
        assert!(deployment.last_execution.is_some());
    }

    #[tokio::test]
    async fn test_prompt_execution() {
        let f = fixture();
        let output = f
            .dispatcher
            .execute(
                "builder",
                Some("plan"),
                json!({"feature": "login"}),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(output["rendered"], "Plan login");
    }

    #[tokio::test]
    async fn test_unknown_task_is_recorded_failure() {
        let f = fixture();
        let err = f
            .dispatcher
            .execute("builder", Some("audit"), json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::TaskNotFound { .. }));

        let stats = f.recorder.get_agent_stats("builder").await.unwrap().unwrap();
        assert_eq!(stats.failed_executions, 1);
        let execs = f.recorder.executions_for("builder");
        assert_eq!(execs[0].status, ExecutionStatus::Failed);
        assert_eq!(
            execs[0].error.as_deref(),
            Some("audit not found in agent builder")
        );
        assert_eq!(
            f.dispatcher.registry().get("builder").await.unwrap().execution_count,
            0
        );
    }

    #[tokio::test]
    async fn test_full_workflow_fail_fast() {
        let f = fixture();
        let err = f
            .dispatcher
            .execute("builder", None, json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Execution(_)));
        assert_eq!(*f.backend.calls.lock(), vec!["fetch", "explode"]);
    }

    #[tokio::test]
    async fn test_full_workflow_continue_on_error() {
        let f = fixture();
        let output = f
            .dispatcher
            .execute(
                "builder",
                Some("default"),
                json!({}),
                ExecuteOptions::continue_on_error(),
            )
            .await
            .unwrap();
        assert_eq!(output["agent"], "builder");
        assert_eq!(output["completed_steps"], 2);
        assert_eq!(output["total_steps"], 3);
        assert_eq!(output["workflow_results"]["fetch"]["step"], "fetch");
        assert!(output["workflow_results"]["explode"]["error"]
            .as_str()
            .unwrap()
            .contains("step exploded"));
        assert_eq!(output["workflow_results"]["package"]["step"], "package");
        assert_eq!(*f.backend.calls.lock(), vec!["fetch", "explode", "package"]);
    }

    #[tokio::test]
    async fn test_context_snapshot_recorded() {
        let f = fixture();
        f.context.set(CURRENT_FEATURE_KEY, json!("checkout"));
        f.dispatcher
            .execute(
                "builder",
                Some("fetch"),
                json!({"x": 1}),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let exec = &f.recorder.executions_for("builder")[0];
        assert_eq!(exec.context_snapshot, Some(json!("checkout")));
        assert_eq!(exec.input, json!({"x": 1}));
        assert_eq!(exec.output.as_ref().unwrap()["step"], "fetch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_recorded() {
        let f = fixture();
        let err = f
            .dispatcher
            .execute(
                "sloth",
                Some("slow"),
                json!({}),
                ExecuteOptions::default().with_timeout_ms(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Timeout { timeout_ms: 100, .. }));
        let stats = f.recorder.get_agent_stats("sloth").await.unwrap().unwrap();
        assert_eq!(stats.failed_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_recorded() {
        let f = fixture();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = f
            .dispatcher
            .execute_with_cancel(
                "sloth",
                Some("slow"),
                json!({}),
                ExecuteOptions::default(),
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Cancelled { .. }));
        let stats = f.recorder.get_agent_stats("sloth").await.unwrap().unwrap();
        assert_eq!(stats.failed_executions, 1);
    }

    #[tokio::test]
    async fn test_missing_agent_is_load_error() {
        let f = fixture();
        let err = f
            .dispatcher
            .execute("ghost", None, json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Load { .. }));
        assert_eq!(f.recorder.execution_count(), 0);
    }
}
