//! Agent — a concurrency-gated executor of commands.
//!
//! Each agent owns its lifecycle status, last heartbeat and a table of
//! in-flight commands. Concurrency is bounded by a counting semaphore sized
//! to `max_concurrent_tasks`; callers beyond capacity wait for a slot, which is
//! the only backpressure in the system.
//!
//! ```text
//! Idle ──execute──► Running ──drained──► Idle
//!   │                  │
//!   └──pause──► Paused ◄┘ ──resume──► Idle
//!  * ──stop──► Stopped ──start──► Idle
//! ```

pub mod handler;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Notify, Semaphore};

use crate::error::ConductorError;
use crate::models::agent::{AgentCapabilities, AgentHealthStatus, AgentInfo, AgentStatus};
use crate::models::command::{AgentCommand, AgentExecutionResult};
use crate::models::value::Value;

pub use handler::{builtin_handler, handler_fn, CommandHandler};

/// Context key an authenticated caller must provide when the agent requires it.
pub const AUTHORIZATION_CONTEXT_KEY: &str = "authorization";

#[derive(Debug, Clone)]
struct InFlightTask {
    command_type: String,
    started_at: DateTime<Utc>,
}

struct AgentState {
    status: AgentStatus,
    last_heartbeat: DateTime<Utc>,
    in_flight: HashMap<String, InFlightTask>,
    completed: u64,
    failed: u64,
}

pub struct Agent {
    id: String,
    name: String,
    capabilities: AgentCapabilities,
    handler: Arc<dyn CommandHandler>,
    slots: Semaphore,
    state: Mutex<AgentState>,
    drained: Notify,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capabilities: AgentCapabilities,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let slots = capabilities.slots();
        Self {
            id: id.into(),
            name: name.into(),
            capabilities,
            handler,
            slots: Semaphore::new(slots),
            state: Mutex::new(AgentState {
                status: AgentStatus::Idle,
                last_heartbeat: Utc::now(),
                in_flight: HashMap::new(),
                completed: 0,
                failed: 0,
            }),
            drained: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    pub fn status(&self) -> AgentStatus {
        self.lock().status
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Ids of commands currently executing.
    pub fn in_flight_commands(&self) -> Vec<String> {
        self.lock().in_flight.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        // State stays consistent across a poisoned lock: every mutation is a
        // single field assignment or map operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stamp the liveness timestamp.
    pub fn heartbeat(&self) {
        self.lock().last_heartbeat = Utc::now();
    }

    /// Execute a command under the concurrency gate.
    ///
    /// Never fails: rejections, handler errors and handler panics all come
    /// back as a result with `success == false`.
    pub async fn execute(&self, command: &AgentCommand) -> AgentExecutionResult {
        let early = self.rejection_reason(&self.lock(), command);
        if let Some(reason) = early {
            tracing::warn!("[Agent] {} rejected command {}: {}", self.id, command.id, reason);
            return AgentExecutionResult::rejected(command, reason);
        }

        let _permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return AgentExecutionResult::rejected(
                    command,
                    format!("Agent '{}' is no longer accepting commands", self.id),
                )
            }
        };

        // Checked again under the lock that registers the command, so a
        // concurrent `stop()` either sees it in flight or makes it bounce.
        let mut result = AgentExecutionResult::started(command);
        let guard = match InFlightGuard::enter(self, command) {
            Ok(guard) => guard,
            Err(reason) => {
                tracing::warn!("[Agent] {} rejected command {}: {}", self.id, command.id, reason);
                return AgentExecutionResult::rejected(command, reason);
            }
        };

        tracing::debug!(
            "[Agent] {} executing command {} (type: {}, priority: {})",
            self.id,
            command.id,
            command.command_type,
            command.priority.as_str()
        );
        result.logs.push(format!(
            "agent {} started command {} ({})",
            self.id, command.id, command.command_type
        ));

        let outcome = AssertUnwindSafe(self.handler.handle(command))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => {
                result.succeed(output);
                result.logs.push("handler completed".to_string());
            }
            Ok(Err(e)) => {
                tracing::warn!("[Agent] {} handler failed for {}: {}", self.id, command.id, e);
                result.logs.push(format!("handler failed: {}", e));
                result.fail(e.message);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    "[Agent] {} handler panicked for {}: {}",
                    self.id,
                    command.id,
                    message
                );
                result.logs.push(format!("handler panicked: {}", message));
                result.fail(format!("Handler panicked: {}", message));
            }
        }
        result.finish();

        guard.release(result.success);
        result
    }

    fn rejection_reason(&self, state: &AgentState, command: &AgentCommand) -> Option<String> {
        match state.status {
            AgentStatus::Stopped => return Some(format!("Agent '{}' is stopped", self.id)),
            AgentStatus::Paused => return Some(format!("Agent '{}' is paused", self.id)),
            _ => {}
        }
        if self.capabilities.requires_authentication
            && command
                .context
                .get(AUTHORIZATION_CONTEXT_KEY)
                .map_or(true, |v| !v.truthy())
        {
            return Some(format!(
                "Agent '{}' requires an authentication context",
                self.id
            ));
        }
        None
    }

    /// Synchronous health snapshot. Always succeeds.
    pub fn health(&self) -> AgentHealthStatus {
        let state = self.lock();
        let mut metrics = self.capabilities.metrics.clone();
        metrics.insert("completedCommands".to_string(), Value::Int(state.completed as i64));
        metrics.insert("failedCommands".to_string(), Value::Int(state.failed as i64));
        if let Some(oldest) = state.in_flight.values().map(|t| t.started_at).min() {
            metrics.insert("oldestInFlightSince".to_string(), Value::String(oldest.to_rfc3339()));
        }
        AgentHealthStatus {
            agent_id: self.id.clone(),
            status: state.status,
            healthy: !matches!(state.status, AgentStatus::Stopped | AgentStatus::Error),
            in_flight: state.in_flight.len(),
            max_concurrent_tasks: self.capabilities.slots(),
            last_heartbeat: state.last_heartbeat,
            metrics,
            message: None,
        }
    }

    pub fn info(&self) -> AgentInfo {
        let state = self.lock();
        AgentInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: state.status,
            capabilities: self.capabilities.clone(),
            last_heartbeat: state.last_heartbeat,
        }
    }

    /// Bring a stopped agent back to Idle. No-op for agents already live.
    pub fn start(&self) {
        let mut state = self.lock();
        if matches!(state.status, AgentStatus::Stopped | AgentStatus::Error) {
            state.status = AgentStatus::Idle;
        }
        state.last_heartbeat = Utc::now();
        tracing::info!("[Agent] {} started", self.id);
    }

    /// Stop accepting commands and wait for every in-flight command to finish.
    pub async fn stop(&self) {
        {
            let mut state = self.lock();
            state.status = AgentStatus::Stopped;
            tracing::info!(
                "[Agent] {} stopping, draining {} in-flight command(s)",
                self.id,
                state.in_flight.len()
            );
        }
        loop {
            let drained = self.drained.notified();
            if self.lock().in_flight.is_empty() {
                break;
            }
            drained.await;
        }
        tracing::info!("[Agent] {} stopped", self.id);
    }

    pub fn pause(&self) -> Result<(), ConductorError> {
        let mut state = self.lock();
        match state.status {
            AgentStatus::Idle | AgentStatus::Running | AgentStatus::Paused => {
                state.status = AgentStatus::Paused;
                Ok(())
            }
            other => Err(ConductorError::Validation(format!(
                "Cannot pause agent '{}' in status {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    pub fn resume(&self) -> Result<(), ConductorError> {
        let mut state = self.lock();
        match state.status {
            AgentStatus::Paused => {
                state.status = if state.in_flight.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Running
                };
                state.last_heartbeat = Utc::now();
                Ok(())
            }
            AgentStatus::Idle | AgentStatus::Running => Ok(()),
            other => Err(ConductorError::Validation(format!(
                "Cannot resume agent '{}' in status {}",
                self.id,
                other.as_str()
            ))),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handler", &self.handler.kind())
            .field("status", &self.status())
            .finish()
    }
}

/// Registration of one command in the in-flight table. Dropping the guard
/// (normally or because the caller abandoned the future) removes the entry,
/// resets Running to Idle once the table is empty and wakes `stop()`.
struct InFlightGuard<'a> {
    agent: &'a Agent,
    command_id: String,
    outcome: Option<bool>,
}

impl<'a> InFlightGuard<'a> {
    fn enter(agent: &'a Agent, command: &AgentCommand) -> Result<Self, String> {
        let mut state = agent.lock();
        if let Some(reason) = agent.rejection_reason(&state, command) {
            return Err(reason);
        }
        if state.in_flight.contains_key(&command.id) {
            return Err(format!("Command '{}' is already in flight", command.id));
        }
        state.in_flight.insert(
            command.id.clone(),
            InFlightTask {
                command_type: command.command_type.clone(),
                started_at: Utc::now(),
            },
        );
        if state.status == AgentStatus::Idle {
            state.status = AgentStatus::Running;
        }
        state.last_heartbeat = Utc::now();
        Ok(Self {
            agent,
            command_id: command.id.clone(),
            outcome: None,
        })
    }

    fn release(mut self, success: bool) {
        self.outcome = Some(success);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.agent.lock();
            if let Some(task) = state.in_flight.remove(&self.command_id) {
                tracing::trace!(
                    "[Agent] {} finished {} command {}",
                    self.agent.id,
                    task.command_type,
                    self.command_id
                );
            }
            match self.outcome {
                Some(true) => state.completed += 1,
                _ => state.failed += 1,
            }
            if state.in_flight.is_empty() && state.status == AgentStatus::Running {
                state.status = AgentStatus::Idle;
            }
            state.last_heartbeat = Utc::now();
        }
        self.agent.drained.notify_waiters();
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::models::value::ValueMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Handler that records the peak number of concurrent invocations.
    fn gauge_handler(
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold_ms: u64,
    ) -> Arc<dyn CommandHandler> {
        handler_fn("gauge", move |_cmd| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(ValueMap::new())
            }
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let agent = Arc::new(Agent::new(
            "worker",
            "Worker",
            AgentCapabilities::default().with_max_concurrent_tasks(2),
            gauge_handler(current, peak.clone(), 40),
        ));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let agent = agent.clone();
            handles.push(tokio::spawn(async move {
                agent.execute(&AgentCommand::new("worker", "work")).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().success);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert_eq!(agent.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_extra_caller_waits_for_slot() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let agent = Arc::new(Agent::new(
            "serial",
            "Serial",
            AgentCapabilities::default(),
            gauge_handler(current, peak, 150),
        ));

        let first = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.execute(&AgentCommand::new("serial", "w")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agent.status(), AgentStatus::Running);

        let second = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.execute(&AgentCommand::new("serial", "w")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Second caller is blocked on the gate, not registered as in flight.
        assert_eq!(agent.in_flight_count(), 1);

        let r1 = first.await.unwrap();
        let r2 = second.await.unwrap();
        assert!(r1.success && r2.success);
        assert!(r2.start_time >= r1.end_time.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_agent_rejects_without_executing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let agent = Agent::new(
            "a",
            "A",
            AgentCapabilities::default(),
            handler_fn("count", move |_cmd| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ValueMap::new())
                }
            }),
        );
        agent.stop().await;
        let result = agent.execute(&AgentCommand::new("a", "x")).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("stopped"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        agent.start();
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert!(agent.execute(&AgentCommand::new("a", "x")).await.success);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_failed_results() {
        let failing = Agent::new(
            "f",
            "F",
            AgentCapabilities::default(),
            handler_fn("fail", |_cmd| async { Err(HandlerError::new("model unavailable")) }),
        );
        let result = failing.execute(&AgentCommand::new("f", "x")).await;
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("model unavailable"));
        assert!(result.end_time.is_some());
        assert_eq!(failing.status(), AgentStatus::Idle);

        let panicking = Agent::new(
            "p",
            "P",
            AgentCapabilities::default(),
            handler_fn("panic", |_cmd| async {
                if true {
                    panic!("boom");
                }
                Ok(ValueMap::new())
            }),
        );
        let result = panicking.execute(&AgentCommand::new("p", "x")).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("boom"));
        assert_eq!(panicking.in_flight_count(), 0);
        assert_eq!(panicking.health().metrics["failedCommands"], Value::Int(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_drains_in_flight_commands() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let agent = Arc::new(Agent::new(
            "d",
            "D",
            AgentCapabilities::default().with_max_concurrent_tasks(3),
            gauge_handler(current, peak, 100),
        ));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let agent = agent.clone();
            handles.push(tokio::spawn(async move {
                agent.execute(&AgentCommand::new("d", "w")).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.in_flight_count(), 3);

        agent.stop().await;
        assert_eq!(agent.in_flight_count(), 0);
        assert_eq!(agent.status(), AgentStatus::Stopped);
        for h in handles {
            let result = h.await.unwrap();
            assert!(result.success);
            assert!(result.end_time.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_handler_starts_after_stop_returns() {
        use std::sync::atomic::AtomicBool;

        let late_starts = Arc::new(AtomicUsize::new(0));
        for i in 0..2_000 {
            let stopped = Arc::new(AtomicBool::new(false));
            let handler = {
                let stopped = stopped.clone();
                let late_starts = late_starts.clone();
                handler_fn("flag", move |_cmd| {
                    if stopped.load(Ordering::SeqCst) {
                        late_starts.fetch_add(1, Ordering::SeqCst);
                    }
                    async { Ok(ValueMap::new()) }
                })
            };
            let agent = Arc::new(Agent::new(
                "r",
                "R",
                AgentCapabilities::default().with_max_concurrent_tasks(4),
                handler,
            ));

            let racer = {
                let agent = agent.clone();
                tokio::spawn(async move { agent.execute(&AgentCommand::new("r", "race")).await })
            };
            if i % 2 == 0 {
                tokio::task::yield_now().await;
            }
            agent.stop().await;
            stopped.store(true, Ordering::SeqCst);
            assert_eq!(agent.in_flight_count(), 0);

            let result = racer.await.unwrap();
            if !result.success {
                assert!(result.error_message.unwrap().contains("stopped"));
            }
        }
        assert_eq!(late_starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pause_resume_and_auth_requirement() {
        let agent = Agent::new(
            "secure",
            "Secure",
            AgentCapabilities::default().requiring_authentication(),
            Arc::new(handler::EchoHandler),
        );
        let anonymous = agent.execute(&AgentCommand::new("secure", "x")).await;
        assert!(!anonymous.success);
        assert!(anonymous.error_message.unwrap().contains("authentication"));

        let mut ctx = ValueMap::new();
        ctx.insert(AUTHORIZATION_CONTEXT_KEY.to_string(), Value::from("Bearer t"));
        let authed = AgentCommand::new("secure", "x").with_context(ctx);
        assert!(agent.execute(&authed).await.success);

        agent.pause().unwrap();
        let paused = agent.execute(&authed).await;
        assert!(paused.error_message.unwrap().contains("paused"));
        agent.resume().unwrap();
        assert_eq!(agent.status(), AgentStatus::Idle);

        let health = agent.health();
        assert!(health.healthy);
        assert_eq!(health.max_concurrent_tasks, 1);
    }

    #[tokio::test]
    async fn test_pause_rejected_when_stopped() {
        let agent =
            Agent::new("s", "S", AgentCapabilities::default(), Arc::new(handler::EchoHandler));
        agent.stop().await;
        assert!(matches!(agent.pause(), Err(ConductorError::Validation(_))));
        assert!(!agent.health().healthy);
    }
}
