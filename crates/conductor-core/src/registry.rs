//! Agent registry — routes commands to agents by id and aggregates health.
//!
//! The registry adds no retry or timeout policy of its own; that belongs to
//! the caller (normally the workflow engine).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::agent::Agent;
use crate::error::ConductorError;
use crate::models::agent::{AgentHealthStatus, AgentInfo};
use crate::models::command::{AgentCommand, AgentExecutionResult};

/// In-memory registry of live agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    /// Heartbeats older than this are reported unhealthy.
    heartbeat_stale_after_secs: Option<u64>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            heartbeat_stale_after_secs: None,
        }
    }

    pub fn with_heartbeat_timeout(mut self, secs: u64) -> Self {
        self.heartbeat_stale_after_secs = Some(secs);
        self
    }

    /// Register an agent. Fails with `Conflict` if the id is taken.
    pub fn register(&self, agent: Arc<Agent>) -> Result<(), ConductorError> {
        let mut agents = self
            .agents
            .write()
            .map_err(|e| ConductorError::Internal(format!("Registry lock poisoned: {}", e)))?;
        if agents.contains_key(agent.id()) {
            return Err(ConductorError::Conflict(format!(
                "Agent '{}' is already registered",
                agent.id()
            )));
        }
        tracing::info!("[Registry] Registered agent {} ({})", agent.id(), agent.name());
        agents.insert(agent.id().to_string(), agent);
        Ok(())
    }

    /// Remove an agent. Fails with `NotFound` if it is absent.
    ///
    /// The agent itself is returned untouched; stopping it is the caller's call.
    pub fn unregister(&self, agent_id: &str) -> Result<Arc<Agent>, ConductorError> {
        let mut agents = self
            .agents
            .write()
            .map_err(|e| ConductorError::Internal(format!("Registry lock poisoned: {}", e)))?;
        match agents.remove(agent_id) {
            Some(agent) => {
                tracing::info!("[Registry] Unregistered agent {}", agent_id);
                Ok(agent)
            }
            None => Err(ConductorError::NotFound(format!("Agent '{}'", agent_id))),
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .ok()
            .and_then(|agents| agents.get(agent_id).cloned())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    /// All agents, sorted by id.
    pub fn list(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<Arc<Agent>> = self
            .agents
            .read()
            .map(|agents| agents.values().cloned().collect())
            .unwrap_or_default();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    pub fn list_info(&self) -> Vec<AgentInfo> {
        self.list().iter().map(|a| a.info()).collect()
    }

    /// Forward a command to the agent with the given id and return exactly
    /// what the agent returned.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        command: &AgentCommand,
    ) -> Result<AgentExecutionResult, ConductorError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Agent '{}'", agent_id)))?;
        Ok(agent.execute(command).await)
    }

    /// Health snapshot of every registered agent.
    ///
    /// A snapshot that cannot be collected is reported as degraded instead of
    /// being dropped from the list.
    pub fn health_of_all(&self) -> Vec<AgentHealthStatus> {
        self.list()
            .iter()
            .map(|agent| {
                let snapshot = std::panic::catch_unwind(AssertUnwindSafe(|| agent.health()));
                match snapshot {
                    Ok(health) => self.apply_staleness(health),
                    Err(_) => {
                        tracing::error!("[Registry] Health check for agent {} failed", agent.id());
                        AgentHealthStatus::degraded(agent.id(), "health check failed")
                    }
                }
            })
            .collect()
    }

    /// Only a busy agent can go stale: heartbeats are stamped around commands,
    /// so an idle agent's old heartbeat says nothing about its liveness.
    fn apply_staleness(&self, mut health: AgentHealthStatus) -> AgentHealthStatus {
        if health.in_flight == 0 {
            return health;
        }
        if let Some(limit) = self.heartbeat_stale_after_secs {
            let age = Utc::now() - health.last_heartbeat;
            if age.num_seconds() > limit as i64 {
                health.healthy = false;
                health.message = Some(format!(
                    "no heartbeat for {}s (limit {}s)",
                    age.num_seconds(),
                    limit
                ));
            }
        }
        health
    }

    /// Stop every agent, waiting for each one to drain.
    pub async fn stop_all(&self) {
        for agent in self.list() {
            agent.stop().await;
        }
    }
}
