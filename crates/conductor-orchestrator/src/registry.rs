use crate::catalog::AgentCatalog;
use crate::types::{AgentDefinition, Deployment};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, Event, EventBus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{info, warn};

struct LiveDeployment {
    deployment: Deployment,
    // Returned to the pool when the deployment is stopped.
    _slot: OwnedSemaphorePermit,
}

/// Tracks which agents are live. At most one deployment exists per agent name,
/// and at most `max_deployments` exist at once.
pub struct DeploymentRegistry {
    catalog: Arc<dyn AgentCatalog>,
    deployments: RwLock<HashMap<String, LiveDeployment>>,
    slots: Arc<Semaphore>,
    limit: usize,
    events: EventBus,
}

impl DeploymentRegistry {
    pub fn new(catalog: Arc<dyn AgentCatalog>, max_deployments: usize, events: EventBus) -> Self {
        let limit = max_deployments.max(1);
        Self {
            catalog,
            deployments: RwLock::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            events,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn AgentCatalog> {
        &self.catalog
    }

    /// Upper bound on live deployments.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Deployments that can still be made before the bound is reached.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Load `agent_name` from the catalog and make it live.
    pub async fn deploy(
        &self,
        agent_name: &str,
        options: serde_json::Value,
    ) -> ConductorResult<Deployment> {
        if self.deployments.read().await.contains_key(agent_name) {
            return Err(ConductorError::AlreadyDeployed(agent_name.to_string()));
        }

        let agent = self.catalog.load_agent(agent_name).await?;
        let deployment = Deployment::new(agent, options);

        {
            // Re-checked under the write lock: another deploy may have won while loading.
            let mut deployments = self.deployments.write().await;
            if deployments.contains_key(agent_name) {
                return Err(ConductorError::AlreadyDeployed(agent_name.to_string()));
            }
            let slot = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
                ConductorError::DeploymentLimit {
                    agent: agent_name.to_string(),
                    limit: self.limit,
                }
            })?;
            deployments.insert(
                agent_name.to_string(),
                LiveDeployment {
                    deployment: deployment.clone(),
                    _slot: slot,
                },
            );
        }

        info!(
            agent = %agent_name,
            version = %deployment.agent.version,
            kind = %deployment.agent.kind,
            "Agent deployed"
        );
        self.events.emit(Event::AgentDeployed {
            agent: agent_name.to_string(),
            deployed_at: deployment.deployed_at,
        });
        Ok(deployment)
    }

    /// Deploy each name independently; one failure never aborts the others.
    pub async fn deploy_multiple(
        &self,
        agent_names: &[String],
        options: serde_json::Value,
    ) -> BTreeMap<String, ConductorResult<Deployment>> {
        let mut results = BTreeMap::new();
        for name in agent_names {
            let result = self.deploy(name, options.clone()).await;
            if let Err(e) = &result {
                warn!(agent = %name, error = %e, "Deployment failed");
            }
            results.insert(name.clone(), result);
        }
        results
    }

    pub async fn stop(&self, agent_name: &str) -> ConductorResult<()> {
        let removed = self.deployments.write().await.remove(agent_name);
        if removed.is_none() {
            return Err(ConductorError::NotDeployed(agent_name.to_string()));
        }
        info!(agent = %agent_name, "Agent stopped");
        self.events.emit(Event::AgentStopped {
            agent: agent_name.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, agent_name: &str) -> Option<Deployment> {
        self.deployments
            .read()
            .await
            .get(agent_name)
            .map(|live| live.deployment.clone())
    }

    pub async fn is_deployed(&self, agent_name: &str) -> bool {
        self.deployments.read().await.contains_key(agent_name)
    }

    /// The live definition of an agent, deploying it with default options first
    /// if necessary.
    pub async fn ensure_deployed(&self, agent_name: &str) -> ConductorResult<AgentDefinition> {
        if let Some(deployment) = self.get(agent_name).await {
            return Ok(deployment.agent);
        }
        info!(agent = %agent_name, "Auto-deploying agent on first use");
        match self.deploy(agent_name, serde_json::Value::Null).await {
            Ok(deployment) => Ok(deployment.agent),
            // Lost a race with a concurrent deploy of the same agent.
            Err(ConductorError::AlreadyDeployed(_)) => self
                .get(agent_name)
                .await
                .map(|d| d.agent)
                .ok_or_else(|| ConductorError::NotDeployed(agent_name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Count one successful execution against a live deployment.
    ///
    /// Returns false if the agent was stopped while the execution was in flight.
    pub async fn record_execution(&self, agent_name: &str, at: DateTime<Utc>) -> bool {
        let mut deployments = self.deployments.write().await;
        match deployments.get_mut(agent_name) {
            Some(live) => {
                live.deployment.execution_count += 1;
                live.deployment.last_execution = Some(at);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live deployments, ordered by agent name.
    pub async fn list(&self) -> Vec<Deployment> {
        let deployments = self.deployments.read().await;
        let mut all: Vec<Deployment> = deployments
            .values()
            .map(|live| live.deployment.clone())
            .collect();
        all.sort_by(|a, b| a.agent.name.cmp(&b.agent.name));
        all
    }

    pub async fn active_count(&self) -> usize {
        self.deployments.read().await.len()
    }
}
