//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! conductor-core services through `AppState`.

pub mod agent;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::models::{Value, ValueMap};
use conductor_core::state::{AppState, AppStateInner};
use conductor_core::{ConductorConfig, ConductorError, Database};

/// Initialize a shared `AppState`.
///
/// The database path is taken from `--db`, then the config file, then
/// `~/.conductor/conductor.db`. Without a config file every builtin handler
/// is registered as an agent of the same name.
pub async fn init_state(
    db_path: Option<&str>,
    config_path: Option<&str>,
) -> Result<AppState, String> {
    let config = match config_path {
        Some(path) => ConductorConfig::from_file(path).map_err(|e| e.to_string())?,
        None => ConductorConfig::with_builtin_agents(),
    };

    let db_path = db_path
        .map(str::to_string)
        .or_else(|| config.database.clone())
        .unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;

    let inner = AppStateInner::new(db, config).map_err(|e| e.to_string())?;
    tracing::debug!("[CLI] {} agent(s) registered", inner.registry.list().len());
    Ok(Arc::new(inner))
}

fn default_db_path() -> String {
    dirs::home_dir()
        .map(|home| home.join(".conductor").join("conductor.db"))
        .unwrap_or_else(|| PathBuf::from("conductor.db"))
        .to_string_lossy()
        .to_string()
}

/// Parse repeated `key=value` arguments into workflow input.
///
/// Values that parse as JSON keep their type (`n=3`, `flag=true`,
/// `tags=["a","b"]`); anything else is taken as a plain string.
pub fn parse_inputs(pairs: &[String]) -> Result<ValueMap, String> {
    let mut input = ValueMap::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid input '{}': expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid input '{}': empty key", pair));
        }
        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => Value::from(json),
            Err(_) => Value::String(raw.to_string()),
        };
        input.insert(key.to_string(), value);
    }
    Ok(input)
}

/// Render a core error for the terminal.
pub(crate) fn describe(e: ConductorError) -> String {
    tracing::debug!("[CLI] command failed ({}): {}", e.kind(), e);
    e.to_string()
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Pretty-print any serializable record.
pub fn print_record<T: serde::Serialize>(record: &T) -> Result<(), String> {
    let value = serde_json::to_value(record).map_err(|e| e.to_string())?;
    print_json(&value);
    Ok(())
}

/// Cut a cell to `max` characters, marking the cut with an ellipsis.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

/// Horizontal table rule over columns of the given content widths.
pub(crate) fn rule(left: char, mid: char, right: char, widths: &[usize]) -> String {
    let cells: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
    format!("{}{}{}\n", left, cells.join(&mid.to_string()), right)
}
