//! Conductor configuration — engine tuning plus the agents to register.
//!
//! ```yaml
//! database: ~/.conductor/conductor.db
//! engine:
//!   defaultStepTimeoutSecs: 120
//!   retryBackoffMs: 250
//! agents:
//!   - id: echo
//!     name: Echo agent
//!     handler: echo
//!     capabilities:
//!       maxConcurrentTasks: 4
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{builtin_handler, handler::builtin_kinds, Agent};
use crate::error::ConductorError;
use crate::models::agent::AgentCapabilities;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConductorConfig {
    /// SQLite path. `None` falls back to the CLI default location.
    pub database: Option<String>,
    pub engine: EngineConfig,
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Used when a step does not set its own timeout.
    pub default_step_timeout_secs: u64,
    /// Pause between retry attempts of a failed step.
    pub retry_backoff_ms: u64,
    /// Heartbeats older than this make an agent unhealthy.
    pub heartbeat_stale_after_secs: u64,
    /// Validator warns about steps retrying more than this.
    pub max_retry_warning: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 300,
            retry_backoff_ms: 0,
            heartbeat_stale_after_secs: 300,
            max_retry_warning: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Builtin handler kind (`echo`, `delay`, `template`).
    pub handler: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
}

impl AgentConfig {
    pub fn new(id: &str, handler: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            handler: handler.to_string(),
            capabilities: AgentCapabilities::default(),
        }
    }

    /// Build the agent, resolving the builtin handler.
    pub fn build(&self) -> Result<Agent, ConductorError> {
        let handler = builtin_handler(&self.handler).ok_or_else(|| {
            ConductorError::Validation(format!(
                "Agent '{}' uses unknown handler '{}' (available: {})",
                self.id,
                self.handler,
                builtin_kinds().join(", ")
            ))
        })?;
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        Ok(Agent::new(&self.id, name, self.capabilities.clone(), handler))
    }
}

impl ConductorConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConductorError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConductorError::Validation(format!("Invalid config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Validation(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Configuration used when no file is given: one agent per builtin handler.
    pub fn with_builtin_agents() -> Self {
        Self {
            agents: builtin_kinds()
                .iter()
                .map(|kind| AgentConfig::new(kind, kind))
                .collect(),
            ..Self::default()
        }
    }

    /// Create a registry holding every configured agent.
    pub fn build_registry(&self) -> Result<AgentRegistry, ConductorError> {
        let registry =
            AgentRegistry::new().with_heartbeat_timeout(self.engine.heartbeat_stale_after_secs);
        for agent in &self.agents {
            registry.register(Arc::new(agent.build()?))?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = ConductorConfig::from_yaml(
            r#"
engine:
  retryBackoffMs: 25
agents:
  - id: fast-echo
    handler: echo
    capabilities:
      maxConcurrentTasks: 4
  - id: tpl
    name: Templater
    handler: template
"#,
        )
        .unwrap();
        assert_eq!(config.engine.retry_backoff_ms, 25);
        assert_eq!(config.engine.default_step_timeout_secs, 300);
        assert!(config.database.is_none());

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.get("fast-echo").unwrap().capabilities().max_concurrent_tasks, 4);
        assert_eq!(registry.get("tpl").unwrap().name(), "Templater");
    }

    #[test]
    fn test_unknown_handler_and_duplicate_agent() {
        let mut config = ConductorConfig::default();
        config.agents.push(AgentConfig::new("x", "gpt"));
        assert!(matches!(config.build_registry(), Err(ConductorError::Validation(_))));

        let mut config = ConductorConfig::default();
        config.agents.push(AgentConfig::new("x", "echo"));
        config.agents.push(AgentConfig::new("x", "delay"));
        assert!(matches!(config.build_registry(), Err(ConductorError::Conflict(_))));
    }

    #[test]
    fn test_builtin_agents_and_file_loading() {
        let registry = ConductorConfig::with_builtin_agents().build_registry().unwrap();
        assert_eq!(registry.list().len(), builtin_kinds().len());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.yaml");
        std::fs::write(&path, "database: /tmp/c.db\n").unwrap();
        let config = ConductorConfig::from_file(&path).unwrap();
        assert_eq!(config.database.as_deref(), Some("/tmp/c.db"));
        assert!(ConductorConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
