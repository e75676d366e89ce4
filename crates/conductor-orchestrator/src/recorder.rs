use crate::types::{AgentStats, Execution, WorkflowRun};
use async_trait::async_trait;
use chrono::Utc;
use conductor_core::ConductorResult;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persistence for execution history and per-agent aggregate counters.
#[async_trait]
pub trait StatsRecorder: Send + Sync {
    /// A dispatch entered `running`.
    async fn record_execution_start(&self, execution: &Execution) -> ConductorResult<()>;

    /// A dispatch reached a terminal state. Updates the agent's counters.
    async fn record_execution_complete(&self, execution: &Execution) -> ConductorResult<()>;

    /// A cross-agent workflow run reached a terminal state.
    async fn record_workflow_execution(&self, run: &WorkflowRun) -> ConductorResult<()>;

    /// Counters for one agent, `None` if it never executed.
    async fn get_agent_stats(&self, agent: &str) -> ConductorResult<Option<AgentStats>>;
}

/// Fold a settled execution into its agent's counters.
fn fold_stats(stats: &mut HashMap<String, AgentStats>, execution: &Execution) {
    let success = execution.success.unwrap_or(false);
    let duration = execution.duration_ms.unwrap_or_default();
    let at = execution.completed_at.unwrap_or_else(Utc::now);
    stats
        .entry(execution.agent_name.clone())
        .or_default()
        .record(success, duration, at);
}

#[derive(Default)]
struct RecorderState {
    executions: HashMap<Uuid, Execution>,
    order: Vec<Uuid>,
    workflows: Vec<WorkflowRun>,
    stats: HashMap<String, AgentStats>,
}

/// Recorder keeping everything in process memory.
#[derive(Default)]
pub struct InMemoryRecorder {
    state: RwLock<RecorderState>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution(&self, id: Uuid) -> Option<Execution> {
        self.state.read().executions.get(&id).cloned()
    }

    /// Executions of one agent, oldest first.
    pub fn executions_for(&self, agent: &str) -> Vec<Execution> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.executions.get(id))
            .filter(|e| e.agent_name == agent)
            .cloned()
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.state.read().executions.len()
    }

    pub fn workflow_records(&self) -> Vec<WorkflowRun> {
        self.state.read().workflows.clone()
    }

    pub fn all_stats(&self) -> HashMap<String, AgentStats> {
        self.state.read().stats.clone()
    }

    fn upsert(state: &mut RecorderState, execution: &Execution) {
        if state
            .executions
            .insert(execution.id, execution.clone())
            .is_none()
        {
            state.order.push(execution.id);
        }
    }
}

#[async_trait]
impl StatsRecorder for InMemoryRecorder {
    async fn record_execution_start(&self, execution: &Execution) -> ConductorResult<()> {
        Self::upsert(&mut self.state.write(), execution);
        Ok(())
    }

    async fn record_execution_complete(&self, execution: &Execution) -> ConductorResult<()> {
        let mut state = self.state.write();
        Self::upsert(&mut state, execution);
        fold_stats(&mut state.stats, execution);
        Ok(())
    }

    async fn record_workflow_execution(&self, run: &WorkflowRun) -> ConductorResult<()> {
        self.state.write().workflows.push(run.clone());
        Ok(())
    }

    async fn get_agent_stats(&self, agent: &str) -> ConductorResult<Option<AgentStats>> {
        Ok(self.state.read().stats.get(agent).cloned())
    }
}

/// Recorder appending every record as a JSON line under a data directory.
///
/// Writes `executions.jsonl` (one line per state change) and `workflows.jsonl`.
/// Only the per-agent counters stay in memory; the history lives on disk.
pub struct JsonlRecorder {
    stats: RwLock<HashMap<String, AgentStats>>,
    executions: Mutex<tokio::fs::File>,
    workflows: Mutex<tokio::fs::File>,
    dir: PathBuf,
}

#[derive(Serialize)]
struct ExecutionLine<'a> {
    phase: &'static str,
    #[serde(flatten)]
    execution: &'a Execution,
}

impl JsonlRecorder {
    pub async fn new(dir: impl Into<PathBuf>) -> ConductorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let executions = Self::open(&dir.join("executions.jsonl")).await?;
        let workflows = Self::open(&dir.join("workflows.jsonl")).await?;
        Ok(Self {
            stats: RwLock::new(HashMap::new()),
            executions: Mutex::new(executions),
            workflows: Mutex::new(workflows),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn open(path: &Path) -> ConductorResult<tokio::fs::File> {
        Ok(tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    async fn append<T: Serialize>(
        file: &Mutex<tokio::fs::File>,
        record: &T,
    ) -> ConductorResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StatsRecorder for JsonlRecorder {
    async fn record_execution_start(&self, execution: &Execution) -> ConductorResult<()> {
        Self::append(
            &self.executions,
            &ExecutionLine {
                phase: "start",
                execution,
            },
        )
        .await
    }

    async fn record_execution_complete(&self, execution: &Execution) -> ConductorResult<()> {
        fold_stats(&mut self.stats.write(), execution);
        Self::append(
            &self.executions,
            &ExecutionLine {
                phase: "complete",
                execution,
            },
        )
        .await
    }

    async fn record_workflow_execution(&self, run: &WorkflowRun) -> ConductorResult<()> {
        Self::append(&self.workflows, run).await
    }

    async fn get_agent_stats(&self, agent: &str) -> ConductorResult<Option<AgentStats>> {
        Ok(self.stats.read().get(agent).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, FailurePolicy};
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_counts() {
        let recorder = InMemoryRecorder::new();
        for i in 0..5 {
            let mut exec = Execution::start("builder", "compile", json!({}), None);
            recorder.record_execution_start(&exec).await.unwrap();
            if i % 2 == 0 {
                exec.complete(json!("ok"));
            } else {
                exec.fail("boom");
            }
            recorder.record_execution_complete(&exec).await.unwrap();
        }
        let stats = recorder.get_agent_stats("builder").await.unwrap().unwrap();
        assert_eq!(stats.total_executions, 5);
        assert_eq!(stats.successful_executions, 3);
        assert_eq!(stats.failed_executions, 2);
        assert_eq!(recorder.executions_for("builder").len(), 5);
        assert!(recorder.get_agent_stats("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_keeps_running_record() {
        let recorder = InMemoryRecorder::new();
        let exec = Execution::start("a", "t", json!({"x": 1}), Some(json!("feature")));
        recorder.record_execution_start(&exec).await.unwrap();
        let stored = recorder.execution(exec.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert_eq!(stored.context_snapshot, Some(json!("feature")));
        assert!(recorder.get_agent_stats("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_recorder_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("history")).await.unwrap();

        let mut exec = Execution::start("a", "t", json!(null), None);
        recorder.record_execution_start(&exec).await.unwrap();
        exec.complete(json!({"done": true}));
        recorder.record_execution_complete(&exec).await.unwrap();
        recorder
            .record_workflow_execution(&WorkflowRun::new(vec![], FailurePolicy::FailFast))
            .await
            .unwrap();

        let lines = std::fs::read_to_string(recorder.dir().join("executions.jsonl")).unwrap();
        let phases: Vec<String> = lines
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["phase"].to_string())
            .collect();
        assert_eq!(phases, vec!["\"start\"", "\"complete\""]);

        let workflows = std::fs::read_to_string(recorder.dir().join("workflows.jsonl")).unwrap();
        assert_eq!(workflows.lines().count(), 1);

        let stats = recorder.get_agent_stats("a").await.unwrap().unwrap();
        assert_eq!(stats.successful_executions, 1);
        assert!(recorder.get_agent_stats("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_recorder_keeps_only_counters() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path()).await.unwrap();
        for i in 0..50 {
            let mut exec = Execution::start("builder", "compile", json!({"n": i}), None);
            recorder.record_execution_start(&exec).await.unwrap();
            exec.fail("boom");
            recorder.record_execution_complete(&exec).await.unwrap();
        }

        assert_eq!(recorder.stats.read().len(), 1);
        let stats = recorder.get_agent_stats("builder").await.unwrap().unwrap();
        assert_eq!(stats.total_executions, 50);
        assert_eq!(stats.failed_executions, 50);

        let lines = std::fs::read_to_string(dir.path().join("executions.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 100);
    }
}
