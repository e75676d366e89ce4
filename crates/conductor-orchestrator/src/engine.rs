use crate::backend::ToolBackend;
use crate::catalog::{AgentCatalog, DirectoryCatalog};
use crate::config::OrchestratorConfig;
use crate::context::SharedContext;
use crate::dispatcher::Dispatcher;
use crate::messaging::{AgentMessage, MessageRelay};
use crate::recorder::StatsRecorder;
use crate::registry::DeploymentRegistry;
use crate::types::{
    AgentActivity, AgentStats, AgentStatusReport, AgentSummary, CrossAgentStep, Deployment,
    ExecuteOptions, FailurePolicy, WorkflowRun,
};
use crate::workflow::WorkflowScheduler;
use conductor_core::{ConductorResult, Event, EventBus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// The orchestration engine.
///
/// Owns every piece of engine state. Build one at process start and share it
/// behind an `Arc`; all operations take `&self`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DeploymentRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: WorkflowScheduler,
    relay: MessageRelay,
    context: SharedContext,
    recorder: Arc<dyn StatsRecorder>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Wire an orchestrator from its collaborators after validating `config`.
    pub fn new(
        config: OrchestratorConfig,
        catalog: Arc<dyn AgentCatalog>,
        recorder: Arc<dyn StatsRecorder>,
        backend: Arc<dyn ToolBackend>,
    ) -> ConductorResult<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let shutdown = CancellationToken::new();
        let context = SharedContext::new(events.clone());
        let registry = Arc::new(DeploymentRegistry::new(
            catalog,
            config.max_concurrent_agents,
            events.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&recorder),
            backend,
            context.clone(),
            events.clone(),
            config.timeout_for(None),
            shutdown.clone(),
        ));
        let scheduler = WorkflowScheduler::new(
            Arc::clone(&dispatcher),
            Arc::clone(&recorder),
            events.clone(),
        );
        let relay = MessageRelay::new(Arc::clone(&dispatcher));

        info!(
            max_concurrent_agents = config.max_concurrent_agents,
            default_timeout_ms = config.default_timeout_ms,
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            registry,
            dispatcher,
            scheduler,
            relay,
            context,
            recorder,
            events,
            shutdown,
        })
    }

    /// Orchestrator reading agent definitions from `config.agents_dir`.
    pub fn with_directory_catalog(
        config: OrchestratorConfig,
        recorder: Arc<dyn StatsRecorder>,
        backend: Arc<dyn ToolBackend>,
    ) -> ConductorResult<Self> {
        let catalog = Arc::new(DirectoryCatalog::new(config.agents_dir.clone()));
        Self::new(config, catalog, recorder, backend)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to the event stream. Only events emitted after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // --- deployments ---

    pub async fn deploy(
        &self,
        agent_name: &str,
        options: serde_json::Value,
    ) -> ConductorResult<Deployment> {
        self.registry.deploy(agent_name, options).await
    }

    pub async fn deploy_multiple(
        &self,
        agent_names: &[String],
        options: serde_json::Value,
    ) -> BTreeMap<String, ConductorResult<Deployment>> {
        self.registry.deploy_multiple(agent_names, options).await
    }

    pub async fn stop(&self, agent_name: &str) -> ConductorResult<()> {
        self.registry.stop(agent_name).await
    }

    /// Status of any agent name, deployed or not. Never fails.
    pub async fn get_status(&self, agent_name: &str) -> AgentStatusReport {
        let deployment = self.registry.get(agent_name).await;
        let statistics = match self.recorder.get_agent_stats(agent_name).await {
            Ok(stats) => stats.unwrap_or_default(),
            Err(e) => {
                warn!(agent = %agent_name, error = %e, "Failed to read agent statistics");
                AgentStats::default()
            }
        };
        AgentStatusReport {
            name: agent_name.to_string(),
            status: if deployment.is_some() {
                AgentActivity::Active
            } else {
                AgentActivity::Inactive
            },
            deployment,
            statistics,
        }
    }

    /// Every valid catalog entry, marked active when deployed.
    pub async fn list_agents(&self) -> ConductorResult<Vec<AgentSummary>> {
        let definitions = self.registry.catalog().list_agents().await?;
        let mut summaries = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let status = if self.registry.is_deployed(&definition.name).await {
                AgentActivity::Active
            } else {
                AgentActivity::Inactive
            };
            summaries.push(AgentSummary { definition, status });
        }
        Ok(summaries)
    }

    /// Live deployments ordered by agent name.
    pub async fn active_agents(&self) -> Vec<Deployment> {
        self.registry.list().await
    }

    // --- execution ---

    /// Run a task on one agent. `None` or `"default"` runs its full workflow.
    pub async fn execute(
        &self,
        agent_name: &str,
        task: Option<&str>,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> ConductorResult<serde_json::Value> {
        self.dispatcher.execute(agent_name, task, input, options).await
    }

    /// Run a cross-agent workflow in dependency batches.
    pub async fn execute_workflow(
        &self,
        steps: Vec<CrossAgentStep>,
        policy: FailurePolicy,
    ) -> ConductorResult<WorkflowRun> {
        self.scheduler.run(steps, policy).await
    }

    /// Like [`Orchestrator::execute_workflow`], nested under `parent`.
    pub async fn execute_workflow_with_parent(
        &self,
        steps: Vec<CrossAgentStep>,
        policy: FailurePolicy,
        parent: &CancellationToken,
    ) -> ConductorResult<WorkflowRun> {
        self.scheduler.run_with_parent(steps, policy, parent).await
    }

    pub async fn send_message(&self, message: AgentMessage) -> ConductorResult<serde_json::Value> {
        self.relay.send(message).await
    }

    // --- workflow runs ---

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Option<WorkflowRun> {
        self.scheduler.get(workflow_id).await
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowRun> {
        self.scheduler.list().await
    }

    /// Cancel one running workflow. Returns false if no such run is in flight.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> bool {
        let cancelled = self.scheduler.cancel(workflow_id);
        if cancelled {
            info!(workflow_id = %workflow_id, "Workflow cancelled");
        }
        cancelled
    }

    /// Cancel every in-flight dispatch. Later dispatches fail immediately.
    pub fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::DryRunBackend;
    use crate::catalog::InMemoryCatalog;
    use crate::recorder::InMemoryRecorder;
    use crate::types::{AgentDefinition, AgentKind};

    fn orchestrator() -> Orchestrator {
        let catalog = InMemoryCatalog::with_agents([
            AgentDefinition::new("planner", "1.0.0", "Plans", AgentKind::Analysis)
                .with_step("outline", "Outline the work"),
            AgentDefinition::new("coder", "1.0.0", "Codes", AgentKind::Implementation)
                .with_step("implement", "Write code"),
        ])
        .unwrap();
        Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(catalog),
            Arc::new(InMemoryRecorder::new()),
            Arc::new(DryRunBackend),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = OrchestratorConfig {
            max_concurrent_agents: 0,
            ..OrchestratorConfig::default()
        };
        let result = Orchestrator::new(
            config,
            Arc::new(InMemoryCatalog::new()),
            Arc::new(InMemoryRecorder::new()),
            Arc::new(DryRunBackend),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_of_unknown_agent() {
        let orch = orchestrator();
        let status = orch.get_status("nobody").await;
        assert_eq!(status.status, AgentActivity::Inactive);
        assert!(status.deployment.is_none());
        assert_eq!(status.statistics, AgentStats::default());
    }

    #[tokio::test]
    async fn test_list_agents_marks_active() {
        let orch = orchestrator();
        orch.deploy("coder", serde_json::Value::Null).await.unwrap();
        let agents = orch.list_agents().await.unwrap();
        let status: Vec<_> = agents
            .iter()
            .map(|a| (a.definition.name.as_str(), a.status))
            .collect();
        assert_eq!(
            status,
            vec![
                ("coder", AgentActivity::Active),
                ("planner", AgentActivity::Inactive)
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_later_dispatches() {
        let orch = orchestrator();
        orch.shutdown();
        assert!(orch.is_shut_down());
        let err = orch
            .execute(
                "coder",
                Some("implement"),
                serde_json::json!({}),
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, conductor_core::ConductorError::Cancelled { .. }));
    }

    #[test]
    fn test_cancel_unknown_workflow() {
        let orch = orchestrator();
        assert!(!orch.cancel_workflow(Uuid::new_v4()));
    }
}
