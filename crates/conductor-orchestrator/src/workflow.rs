use crate::dispatcher::Dispatcher;
use crate::recorder::StatsRecorder;
use crate::types::{CrossAgentStep, FailurePolicy, WorkflowRun, WorkflowStatus};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Event, EventBus};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Partition steps into dependency layers (Kahn-style).
///
/// Returns step indices per batch. Every step lands in the earliest batch after
/// all of its dependencies; within a batch indices keep input order.
/// A cycle and a reference to an unknown key both fail with
/// [`ConductorError::CircularDependency`], since neither allows progress.
pub fn plan_batches(steps: &[CrossAgentStep]) -> ConductorResult<Vec<Vec<usize>>> {
    let keys: Vec<String> = steps.iter().map(CrossAgentStep::key).collect();
    let mut seen = HashSet::new();
    for key in &keys {
        if !seen.insert(key.as_str()) {
            return Err(ConductorError::Config(format!(
                "duplicate workflow step id: {key}"
            )));
        }
    }

    let deps: Vec<_> = steps.iter().map(CrossAgentStep::dependencies).collect();
    let mut completed: HashSet<&str> = HashSet::new();
    let mut batches = Vec::new();

    while completed.len() < steps.len() {
        let ready: Vec<usize> = (0..steps.len())
            .filter(|&i| !completed.contains(keys[i].as_str()))
            .filter(|&i| deps[i].iter().all(|d| completed.contains(d.as_str())))
            .collect();

        if ready.is_empty() {
            let pending = (0..steps.len())
                .filter(|&i| !completed.contains(keys[i].as_str()))
                .map(|i| keys[i].clone())
                .collect();
            return Err(ConductorError::CircularDependency { pending });
        }

        for &i in &ready {
            completed.insert(keys[i].as_str());
        }
        batches.push(ready);
    }

    Ok(batches)
}

/// Finished runs kept for `get`/`list` before the oldest are dropped.
pub const MAX_RETAINED_RUNS: usize = 1024;

/// Runs keyed by id, with insertion order kept for listing.
struct RunTable {
    runs: HashMap<Uuid, WorkflowRun>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RunTable {
    fn new(capacity: usize) -> Self {
        Self {
            runs: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn upsert(&mut self, run: &WorkflowRun) {
        if self.runs.insert(run.id, run.clone()).is_none() {
            self.order.push_back(run.id);
            self.evict();
        }
    }

    /// Drop the oldest finished runs until the table fits. Runs still pending
    /// or running are never dropped.
    fn evict(&mut self) {
        let mut excess = self.order.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let runs = &mut self.runs;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = runs.get(id).map_or(true, |r| {
                matches!(r.status, WorkflowStatus::Completed | WorkflowStatus::Failed)
            });
            if finished {
                runs.remove(id);
                excess -= 1;
            }
            !finished
        });
    }

    fn get(&self, id: &Uuid) -> Option<WorkflowRun> {
        self.runs.get(id).cloned()
    }

    fn list(&self) -> Vec<WorkflowRun> {
        self.order
            .iter()
            .filter_map(|id| self.runs.get(id).cloned())
            .collect()
    }
}

/// Drives cross-agent workflow runs batch by batch through the dispatcher.
///
/// Batch N+1 starts only after every member of batch N has settled. Members of a
/// batch are all started before any of them is awaited.
pub struct WorkflowScheduler {
    dispatcher: Arc<Dispatcher>,
    recorder: Arc<dyn StatsRecorder>,
    events: EventBus,
    runs: RwLock<RunTable>,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl WorkflowScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        recorder: Arc<dyn StatsRecorder>,
        events: EventBus,
    ) -> Self {
        Self {
            dispatcher,
            recorder,
            events,
            runs: RwLock::new(RunTable::new(MAX_RETAINED_RUNS)),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Run `steps` to completion under `policy`.
    pub async fn run(
        &self,
        steps: Vec<CrossAgentStep>,
        policy: FailurePolicy,
    ) -> ConductorResult<WorkflowRun> {
        let parent = self.dispatcher.shutdown_token().clone();
        self.run_with_parent(steps, policy, &parent).await
    }

    /// Run `steps` as a child of `parent`: cancelling `parent` cancels every
    /// dispatch of this run.
    pub async fn run_with_parent(
        &self,
        steps: Vec<CrossAgentStep>,
        policy: FailurePolicy,
        parent: &CancellationToken,
    ) -> ConductorResult<WorkflowRun> {
        let mut run = WorkflowRun::new(steps, policy);
        let token = parent.child_token();
        self.tokens.lock().insert(run.id, token.clone());
        self.store(&run).await;

        let outcome = self.drive(&mut run, &token).await;
        self.tokens.lock().remove(&run.id);

        match outcome {
            Ok(()) => {
                run.status = WorkflowStatus::Completed;
                run.completed_at = Some(Utc::now());
                self.store(&run).await;
                self.persist(&run).await;
                let duration_ms = run.duration_ms().unwrap_or_default();
                info!(
                    workflow_id = %run.id,
                    steps = run.steps.len(),
                    batches = run.batches.len(),
                    failed_steps = run.failed_steps.len(),
                    duration_ms,
                    "Workflow completed"
                );
                self.events.emit(Event::WorkflowCompleted {
                    workflow_id: run.id,
                    duration_ms,
                    results: run.results.clone(),
                });
                Ok(run)
            }
            Err(e) => {
                run.status = WorkflowStatus::Failed;
                run.completed_at = Some(Utc::now());
                run.error = Some(e.to_string());
                self.store(&run).await;
                self.persist(&run).await;
                error!(workflow_id = %run.id, error = %e, "Workflow failed");
                self.events.emit(Event::WorkflowFailed {
                    workflow_id: run.id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut WorkflowRun,
        token: &CancellationToken,
    ) -> ConductorResult<()> {
        run.status = WorkflowStatus::Running;
        run.started_at = Some(Utc::now());
        self.store(run).await;

        let plan = plan_batches(&run.steps)?;
        run.batches = plan
            .iter()
            .map(|batch| batch.iter().map(|&i| run.steps[i].key()).collect())
            .collect();
        self.store(run).await;

        info!(
            workflow_id = %run.id,
            steps = run.steps.len(),
            batches = plan.len(),
            policy = ?run.failure_policy,
            "Workflow started"
        );

        for (n, batch) in plan.iter().enumerate() {
            info!(workflow_id = %run.id, batch = n, size = batch.len(), "Running batch");

            let dispatches = batch.iter().map(|&i| {
                let step = &run.steps[i];
                self.dispatcher.execute_with_cancel(
                    &step.agent,
                    Some(step.task.as_str()),
                    step.input.clone(),
                    step.options.clone(),
                    token,
                )
            });
            let outcomes = join_all(dispatches).await;

            let mut first_error = None;
            for (&i, outcome) in batch.iter().zip(outcomes) {
                let key = run.steps[i].key();
                match outcome {
                    Ok(output) => {
                        run.results.insert(key, output);
                    }
                    Err(e) if run.failure_policy == FailurePolicy::ContinueOnError => {
                        warn!(
                            workflow_id = %run.id,
                            step = %key,
                            error = %e,
                            "Step failed, continuing"
                        );
                        run.results
                            .insert(key.clone(), serde_json::json!({ "error": e.to_string() }));
                        run.failed_steps.push(key);
                    }
                    Err(e) => {
                        run.failed_steps.push(key);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            self.store(run).await;

            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(())
    }

    /// Cancel a run in flight. Returns false if it is not running.
    pub fn cancel(&self, workflow_id: Uuid) -> bool {
        match self.tokens.lock().get(&workflow_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Latest state of a run, including one still in flight.
    pub async fn get(&self, workflow_id: Uuid) -> Option<WorkflowRun> {
        self.runs.read().await.get(&workflow_id)
    }

    /// Retained runs, oldest first. At most [`MAX_RETAINED_RUNS`] finished
    /// runs are kept.
    pub async fn list(&self) -> Vec<WorkflowRun> {
        self.runs.read().await.list()
    }

    async fn store(&self, run: &WorkflowRun) {
        self.runs.write().await.upsert(run);
    }

    async fn persist(&self, run: &WorkflowRun) {
        if let Err(e) = self.recorder.record_workflow_execution(run).await {
            warn!(workflow_id = %run.id, error = %e, "Failed to record workflow execution");
        }
    }
}
