//! `conductor agent` — Inspect registered agents.

use conductor_core::models::AgentHealthStatus;
use conductor_core::state::AppState;

use super::{print_record, rule, truncate};

pub async fn list(state: &AppState) -> Result<(), String> {
    print_record(&state.registry.list_info())
}

pub async fn health(state: &AppState) -> Result<(), String> {
    let report = state.registry.health_of_all();
    if report.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    print!("{}", render_health(&report));
    Ok(())
}

pub fn render_health(report: &[AgentHealthStatus]) -> String {
    let widths = [16, 8, 7, 9, 28];
    let mut out = String::new();
    out.push_str(&rule('┌', '┬', '┐', &widths));
    out.push_str(&format!(
        "│ {:<16} │ {:<8} │ {:<7} │ {:<9} │ {:<28} │\n",
        "Agent", "Status", "Healthy", "In-flight", "Message"
    ));
    out.push_str(&rule('├', '┼', '┤', &widths));
    for h in report {
        out.push_str(&format!(
            "│ {:<16} │ {:<8} │ {:<7} │ {:<9} │ {:<28} │\n",
            truncate(&h.agent_id, 16),
            h.status.as_str(),
            if h.healthy { "yes" } else { "no" },
            format!("{}/{}", h.in_flight, h.max_concurrent_tasks),
            truncate(h.message.as_deref().unwrap_or(""), 28)
        ));
    }
    out.push_str(&rule('└', '┴', '┘', &widths));
    out
}
