use crate::types::{AgentDefinition, AgentKind};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of agent definitions.
#[async_trait]
pub trait AgentCatalog: Send + Sync {
    /// Load and validate one definition by name.
    async fn load_agent(&self, name: &str) -> ConductorResult<AgentDefinition>;

    /// Every valid definition the catalog knows about.
    async fn list_agents(&self) -> ConductorResult<Vec<AgentDefinition>>;
}

const REQUIRED_FIELDS: [&str; 4] = ["name", "version", "description", "type"];

/// Validate a raw definition document and convert it into an [`AgentDefinition`].
///
/// `agent` names the definition in error messages when the document itself
/// lacks a usable name.
pub fn validate_definition(
    agent: &str,
    raw: &serde_json::Value,
) -> ConductorResult<AgentDefinition> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ConductorError::load(agent, "definition must be a mapping"))?;

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {}
            Some(serde_json::Value::String(_)) => {
                return Err(ConductorError::load(agent, format!("empty field: {field}")));
            }
            Some(serde_json::Value::Null) | None => {
                return Err(ConductorError::load(
                    agent,
                    format!("missing required field: {field}"),
                ));
            }
            Some(_) => {
                return Err(ConductorError::load(
                    agent,
                    format!("field {field} must be a string"),
                ));
            }
        }
    }

    let kind = obj
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if AgentKind::parse(kind).is_none() {
        return Err(ConductorError::load(
            agent,
            format!("invalid agent type: {kind}"),
        ));
    }

    for field in ["tools", "workflow"] {
        match obj.get(field) {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Array(_)) => {}
            Some(_) => {
                return Err(ConductorError::load(
                    agent,
                    format!("{field} must be a sequence"),
                ));
            }
        }
    }
    match obj.get("prompts") {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => {}
        Some(_) => {
            return Err(ConductorError::load(agent, "prompts must be a mapping"));
        }
    }

    // Null optionals are treated as absent so serde falls back to the field defaults.
    let cleaned: serde_json::Map<String, serde_json::Value> = obj
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let definition: AgentDefinition = serde_json::from_value(serde_json::Value::Object(cleaned))
        .map_err(|e| ConductorError::load(agent, e.to_string()))?;

    let mut seen = std::collections::BTreeSet::new();
    for step in &definition.workflow {
        if !seen.insert(step.step.as_str()) {
            return Err(ConductorError::load(
                agent,
                format!("duplicate workflow step: {}", step.step),
            ));
        }
    }

    Ok(definition)
}

/// Catalog holding raw definition documents in memory.
///
/// Documents are validated on every load, exactly like file-backed definitions.
#[derive(Default)]
pub struct InMemoryCatalog {
    agents: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from already-typed definitions.
    pub fn with_agents(agents: impl IntoIterator<Item = AgentDefinition>) -> ConductorResult<Self> {
        let catalog = Self::new();
        for agent in agents {
            catalog.insert(agent)?;
        }
        Ok(catalog)
    }

    pub fn insert(&self, agent: AgentDefinition) -> ConductorResult<()> {
        let name = agent.name.clone();
        let raw = serde_json::to_value(agent)?;
        self.agents.write().insert(name, raw);
        Ok(())
    }

    /// Store an unvalidated document under `name`.
    pub fn insert_raw(&self, name: impl Into<String>, raw: serde_json::Value) {
        self.agents.write().insert(name.into(), raw);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.agents.write().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl AgentCatalog for InMemoryCatalog {
    async fn load_agent(&self, name: &str) -> ConductorResult<AgentDefinition> {
        let raw = self
            .agents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConductorError::load(name, "agent definition not found"))?;
        validate_definition(name, &raw)
    }

    async fn list_agents(&self) -> ConductorResult<Vec<AgentDefinition>> {
        let entries: Vec<(String, serde_json::Value)> = self
            .agents
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut agents = Vec::with_capacity(entries.len());
        for (name, raw) in entries {
            match validate_definition(&name, &raw) {
                Ok(agent) => agents.push(agent),
                Err(e) => warn!(agent = %name, error = %e, "Skipping invalid agent definition"),
            }
        }
        Ok(agents)
    }
}

const DEFINITION_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Catalog reading one definition file per agent from a directory.
///
/// File layout:
/// ```yaml
/// # agents/code-reviewer.yaml
/// name: code-reviewer
/// version: 1.2.0
/// description: Reviews pull requests
/// type: review
/// tools: [read_file, grep]
/// workflow:
///   - step: scan
///     description: Scan the diff for risky changes
/// prompts:
///   summarize: "Summarize the review of {{target}}"
/// ```
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn find_file(&self, name: &str) -> Option<PathBuf> {
        for ext in DEFINITION_EXTENSIONS {
            let path = self.dir.join(format!("{name}.{ext}"));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    async fn read_document(agent: &str, path: &Path) -> ConductorResult<serde_json::Value> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::load(agent, format!("failed to read {}: {e}", path.display()))
        })?;
        parse_document(agent, path, &raw)
    }
}

fn parse_document(agent: &str, path: &Path, raw: &str) -> ConductorResult<serde_json::Value> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(raw).map_err(|e| ConductorError::load(agent, e.to_string()))
    } else {
        serde_yaml_ng::from_str(raw).map_err(|e| ConductorError::load(agent, e.to_string()))
    }
}

#[async_trait]
impl AgentCatalog for DirectoryCatalog {
    async fn load_agent(&self, name: &str) -> ConductorResult<AgentDefinition> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConductorError::load(name, "invalid agent name"));
        }
        let path = self.find_file(name).await.ok_or_else(|| {
            ConductorError::load(
                name,
                format!("no definition file in {}", self.dir.display()),
            )
        })?;
        debug!(agent = %name, path = %path.display(), "Loading agent definition");

        let raw = Self::read_document(name, &path).await?;
        let definition = validate_definition(name, &raw)?;
        if definition.name != name {
            return Err(ConductorError::load(
                name,
                format!("definition declares name {}", definition.name),
            ));
        }
        Ok(definition)
    }

    async fn list_agents(&self) -> ConductorResult<Vec<AgentDefinition>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !DEFINITION_EXTENSIONS.contains(&ext) {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let loaded = match Self::read_document(&stem, &path).await {
                Ok(raw) => validate_definition(&stem, &raw).and_then(|agent| {
                    if agent.name == stem {
                        Ok(agent)
                    } else {
                        Err(ConductorError::load(
                            &stem,
                            format!("definition declares name {}", agent.name),
                        ))
                    }
                }),
                Err(e) => Err(e),
            };
            match loaded {
                Ok(agent) => agents.push(agent),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid agent definition");
                }
            }
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}
