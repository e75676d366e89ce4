use conductor_core::{ConductorError, ConductorResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, read from the `[orchestrator]` table of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory the file catalog loads agent definitions from.
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
    /// Upper bound on live deployments. Further deploys fail until one is stopped.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Deadline applied to dispatches that do not set their own. `0` disables it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-subscriber buffer of the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Where file-backed recorders write execution history.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("./agents")
}
fn default_max_concurrent_agents() -> usize {
    8
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_event_capacity() -> usize {
    256
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agents_dir: default_agents_dir(),
            max_concurrent_agents: default_max_concurrent_agents(),
            default_timeout_ms: default_timeout_ms(),
            event_capacity: default_event_capacity(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    orchestrator: Option<OrchestratorConfig>,
}

impl OrchestratorConfig {
    /// Parse a TOML document. A missing `[orchestrator]` table yields the defaults.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))?;
        let config = file.orchestrator.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub async fn load(path: &Path) -> ConductorResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_concurrent_agents == 0 {
            return Err(ConductorError::Config(
                "max_concurrent_agents must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConductorError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Deadline for a dispatch: the explicit override, else the configured default.
    pub fn timeout_for(&self, override_ms: Option<u64>) -> Option<Duration> {
        match override_ms.unwrap_or(self.default_timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
