use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::ValueMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "ERROR")]
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "STOPPED" => Some(Self::Stopped),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Declared limits and features of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Concurrency bound; values below 1 are treated as 1.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub supports_async_execution: bool,
    #[serde(default)]
    pub requires_authentication: bool,
    /// Operation tags the agent advertises (informational).
    #[serde(default)]
    pub supported_operations: Vec<String>,
    /// Declared capability metrics reported in health snapshots.
    #[serde(default)]
    pub metrics: ValueMap,
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            supports_async_execution: false,
            requires_authentication: false,
            supported_operations: Vec::new(),
            metrics: ValueMap::new(),
        }
    }
}

impl AgentCapabilities {
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn requiring_authentication(mut self) -> Self {
        self.requires_authentication = true;
        self
    }

    /// The effective slot count (never zero).
    pub fn slots(&self) -> usize {
        self.max_concurrent_tasks.max(1)
    }
}

/// Static description of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub capabilities: AgentCapabilities,
    pub last_heartbeat: DateTime<Utc>,
}

/// Point-in-time health snapshot of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthStatus {
    pub agent_id: String,
    pub status: AgentStatus,
    pub healthy: bool,
    pub in_flight: usize,
    pub max_concurrent_tasks: usize,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metrics: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentHealthStatus {
    /// Snapshot for an agent whose health could not be collected.
    pub fn degraded(agent_id: &str, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Error,
            healthy: false,
            in_flight: 0,
            max_concurrent_tasks: 0,
            last_heartbeat: Utc::now(),
            metrics: ValueMap::new(),
            message: Some(message.into()),
        }
    }
}
