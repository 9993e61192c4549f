//! Command handlers — the capability-specific part of an agent.
//!
//! The engine never looks inside a handler: it only sees the uniform
//! `AgentCommand -> AgentExecutionResult` contract exposed by `Agent`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::models::command::AgentCommand;
use crate::models::value::{lookup_path, Value, ValueMap};

/// Work performed by an agent for one command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Short identifier of the handler kind (e.g. "echo").
    fn kind(&self) -> &str;

    async fn handle(&self, command: &AgentCommand) -> Result<ValueMap, HandlerError>;
}

/// Adapter turning an async closure into a `CommandHandler`.
pub struct FnHandler<F> {
    kind: String,
    f: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(AgentCommand) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ValueMap, HandlerError>> + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn handle(&self, command: &AgentCommand) -> Result<ValueMap, HandlerError> {
        (self.f)(command.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(kind: &str, f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(AgentCommand) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ValueMap, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        kind: kind.to_string(),
        f,
    })
}

// ─── Builtin handlers ──────────────────────────────────────────────────────

/// Returns the command parameters unchanged.
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn handle(&self, command: &AgentCommand) -> Result<ValueMap, HandlerError> {
        Ok(command.parameters.clone())
    }
}

/// Sleeps for `delayMs` milliseconds, then echoes the parameters.
pub struct DelayHandler;

#[async_trait]
impl CommandHandler for DelayHandler {
    fn kind(&self) -> &str {
        "delay"
    }

    async fn handle(&self, command: &AgentCommand) -> Result<ValueMap, HandlerError> {
        let delay_ms = match command.parameters.get("delayMs") {
            None => 0,
            Some(v) => v
                .as_i64()
                .filter(|ms| *ms >= 0)
                .ok_or_else(|| {
                    HandlerError::new(format!("delayMs must be a non-negative integer, got {}", v))
                })?,
        };
        tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        Ok(command.parameters.clone())
    }
}

/// Renders `${key}` placeholders of the `template` parameter against the
/// remaining parameters. Unknown keys are left untouched.
pub struct TemplateHandler;

#[async_trait]
impl CommandHandler for TemplateHandler {
    fn kind(&self) -> &str {
        "template"
    }

    async fn handle(&self, command: &AgentCommand) -> Result<ValueMap, HandlerError> {
        let template = command
            .parameters
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("missing string parameter 'template'"))?;

        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| HandlerError::new(e.to_string()))?;
        let text = re
            .replace_all(template, |caps: &regex::Captures| {
                let key = caps[1].trim();
                lookup_path(&command.parameters, key)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| format!("${{{}}}", key))
            })
            .to_string();

        let mut out = ValueMap::new();
        out.insert("text".to_string(), Value::String(text));
        Ok(out)
    }
}

/// Look up a builtin handler by kind.
pub fn builtin_handler(kind: &str) -> Option<Arc<dyn CommandHandler>> {
    match kind {
        "echo" => Some(Arc::new(EchoHandler)),
        "delay" => Some(Arc::new(DelayHandler)),
        "template" => Some(Arc::new(TemplateHandler)),
        _ => None,
    }
}

pub fn builtin_kinds() -> &'static [&'static str] {
    &["echo", "delay", "template"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        let cmd = AgentCommand::new("a", "echo").with_parameter("x", 1);
        let out = EchoHandler.handle(&cmd).await.unwrap();
        assert_eq!(out.get("x"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_delay_rejects_negative() {
        let cmd = AgentCommand::new("a", "delay").with_parameter("delayMs", -5);
        assert!(DelayHandler.handle(&cmd).await.is_err());
    }

    #[tokio::test]
    async fn test_template_renders_nested_keys() {
        let cmd = AgentCommand::new("a", "template").with_parameters(value_map! {
            "template" => "Hello ${user.name}, you have ${count} items. ${missing}",
            "user" => value_map! { "name" => "Ada" },
            "count" => 3,
        });
        let out = TemplateHandler.handle(&cmd).await.unwrap();
        assert_eq!(
            out.get("text").and_then(Value::as_str),
            Some("Hello Ada, you have 3 items. ${missing}")
        );
    }

    #[test]
    fn test_builtin_lookup() {
        for kind in builtin_kinds() {
            assert_eq!(builtin_handler(kind).map(|h| h.kind().to_string()), Some(kind.to_string()));
        }
        assert!(builtin_handler("llm").is_none());
    }
}
