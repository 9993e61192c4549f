//! Event Bus - fire-and-forget status notifications from the workflow engine.
//!
//! Two delivery styles:
//!   - Direct handlers (`on`/`off`): called on a spawned task for every event
//!   - Buffered subscriptions: matching events are queued per subscription and
//!     drained by the subscriber when convenient
//!
//! Emitting never blocks on, or fails because of, a subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::value::ValueMap;

/// Status-change events emitted while a workflow executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventType {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::ExecutionPaused => "EXECUTION_PAUSED",
            Self::ExecutionResumed => "EXECUTION_RESUMED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EXECUTION_STARTED" => Some(Self::ExecutionStarted),
            "STEP_STARTED" => Some(Self::StepStarted),
            "STEP_COMPLETED" => Some(Self::StepCompleted),
            "STEP_FAILED" => Some(Self::StepFailed),
            "STEP_SKIPPED" => Some(Self::StepSkipped),
            "EXECUTION_PAUSED" => Some(Self::ExecutionPaused),
            "EXECUTION_RESUMED" => Some(Self::ExecutionResumed),
            "EXECUTION_COMPLETED" => Some(Self::ExecutionCompleted),
            "EXECUTION_FAILED" => Some(Self::ExecutionFailed),
            "EXECUTION_CANCELLED" => Some(Self::ExecutionCancelled),
            _ => None,
        }
    }

    /// True for the events that close an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted | Self::ExecutionFailed | Self::ExecutionCancelled
        )
    }
}

/// An event emitted by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: WorkflowEventType,
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data: ValueMap,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event_type: WorkflowEventType, execution_id: &str, workflow_id: &str) -> Self {
        Self {
            event_type,
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            step_id: None,
            data: ValueMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn with_data(mut self, data: ValueMap) -> Self {
        self.data = data;
        self
    }
}

/// Buffered subscription configuration.
#[derive(Debug, Clone)]
pub struct EventSubscription {
    pub id: String,
    /// Empty means every event type.
    pub event_types: Vec<WorkflowEventType>,
    /// Restrict to a single execution.
    pub execution_id: Option<String>,
    /// If true, auto-remove after first matching event delivery
    pub one_shot: bool,
}

impl EventSubscription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_types: Vec::new(),
            execution_id: None,
            one_shot: false,
        }
    }

    pub fn for_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_types(mut self, types: Vec<WorkflowEventType>) -> Self {
        self.event_types = types;
        self
    }

    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }

    fn matches(&self, event: &WorkflowEvent) -> bool {
        if let Some(ref id) = self.execution_id {
            if *id != event.execution_id {
                return false;
            }
        }
        self.event_types.is_empty() || self.event_types.contains(&event.event_type)
    }
}

type EventHandler = Arc<dyn Fn(WorkflowEvent) + Send + Sync>;

struct EventBusInner {
    handlers: HashMap<String, EventHandler>,
    subscriptions: HashMap<String, EventSubscription>,
    pending_events: HashMap<String, Vec<WorkflowEvent>>,
}

/// Thread-safe event bus for workflow status notifications.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<EventBusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EventBusInner {
                handlers: HashMap::new(),
                subscriptions: HashMap::new(),
                pending_events: HashMap::new(),
            })),
        }
    }

    // ─── Direct handlers ────────────────────────────────────────────────

    /// Register a handler under a key, replacing any previous one.
    pub async fn on<F>(&self, key: &str, handler: F)
    where
        F: Fn(WorkflowEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        inner.handlers.insert(key.to_string(), Arc::new(handler));
    }

    /// Remove a handler.
    pub async fn off(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.handlers.remove(key);
    }

    // ─── Publish ────────────────────────────────────────────────────────

    /// Publish an event to every handler and matching subscription.
    pub async fn emit(&self, event: WorkflowEvent) {
        let mut inner = self.inner.write().await;

        for handler in inner.handlers.values() {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                handler(event);
            });
        }

        let matched: Vec<(String, bool)> = inner
            .subscriptions
            .values()
            .filter(|sub| sub.matches(&event))
            .map(|sub| (sub.id.clone(), sub.one_shot))
            .collect();

        for (sub_id, one_shot) in matched {
            inner
                .pending_events
                .entry(sub_id.clone())
                .or_default()
                .push(event.clone());
            if one_shot {
                inner.subscriptions.remove(&sub_id);
            }
        }

        tracing::debug!(
            "[EventBus] {} for execution {}",
            event.event_type.as_str(),
            event.execution_id
        );
    }

    // ─── Buffered subscriptions ─────────────────────────────────────────

    pub async fn subscribe(&self, subscription: EventSubscription) {
        let mut inner = self.inner.write().await;
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.pending_events.remove(subscription_id);
        inner.subscriptions.remove(subscription_id).is_some()
    }

    /// Drain all pending events for a subscription.
    pub async fn drain_pending_events(&self, subscription_id: &str) -> Vec<WorkflowEvent> {
        let mut inner = self.inner.write().await;
        inner
            .pending_events
            .remove(subscription_id)
            .unwrap_or_default()
    }

    /// Get all event types as strings (for CLI output).
    pub fn all_event_types() -> Vec<&'static str> {
        vec![
            "EXECUTION_STARTED",
            "STEP_STARTED",
            "STEP_COMPLETED",
            "STEP_FAILED",
            "STEP_SKIPPED",
            "EXECUTION_PAUSED",
            "EXECUTION_RESUMED",
            "EXECUTION_COMPLETED",
            "EXECUTION_FAILED",
            "EXECUTION_CANCELLED",
        ]
    }
}
