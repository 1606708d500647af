//! Deterministic single-line titles, computed at mapping time.

use athena_protocol::feed::DecisionRecord;
use athena_protocol::session::RunStatus;
use athena_protocol::session::RunTriggerKind;
use athena_protocol::session::SessionSource;

pub const PROMPT_PREVIEW_CHARS: usize = 80;

/// First `max_chars` characters on a char boundary, with an ellipsis marker
/// when truncated. Newlines collapse to spaces so titles stay single-line.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let trimmed = flattened.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}

pub fn session_start(source: &SessionSource, model: Option<&str>) -> String {
    match model {
        Some(model) => format!("Session started ({}, {model})", source.as_str()),
        None => format!("Session started ({})", source.as_str()),
    }
}

pub fn session_end() -> String {
    "Session ended".to_string()
}

pub fn run_start(trigger: RunTriggerKind, prompt_preview: Option<&str>) -> String {
    match prompt_preview {
        Some(preview) if !preview.is_empty() => format!("Run started: {preview}"),
        _ => format!("Run started ({})", trigger.as_str()),
    }
}

pub fn run_end(status: RunStatus) -> String {
    format!("Run {status}")
}

pub fn user_prompt(preview_text: &str) -> String {
    preview_text.to_string()
}

pub fn tool_pre(tool_name: &str) -> String {
    tool_name.to_string()
}

pub fn tool_post(tool_name: &str) -> String {
    format!("{tool_name} finished")
}

pub fn tool_failure(tool_name: &str, error: &str) -> String {
    format!("{tool_name} failed: {}", preview(error, 60))
}

pub fn permission_request(tool_name: &str) -> String {
    format!("Permission requested: {tool_name}")
}

pub fn stop_request() -> String {
    "Agent finished turn".to_string()
}

pub fn decision(record: &DecisionRecord) -> String {
    match record {
        DecisionRecord::Allow => "Allowed".to_string(),
        DecisionRecord::Deny { message } => format!("Denied: {}", preview(message, 60)),
        DecisionRecord::Block { reason } => format!("Blocked: {}", preview(reason, 60)),
        DecisionRecord::NoOpinion { reason } => format!("No opinion ({reason})"),
    }
}

pub fn subagent_start(agent_id: &str, agent_type: Option<&str>) -> String {
    match agent_type {
        Some(kind) => format!("Subagent started: {kind} ({agent_id})"),
        None => format!("Subagent started: {agent_id}"),
    }
}

pub fn subagent_stop(agent_id: &str) -> String {
    format!("Subagent stopped: {agent_id}")
}

pub fn agent_message(text: &str) -> String {
    preview(text, PROMPT_PREVIEW_CHARS)
}

pub fn notification(message: &str) -> String {
    preview(message, PROMPT_PREVIEW_CHARS)
}

pub fn compact_pre() -> String {
    "Compacting conversation".to_string()
}

pub fn setup() -> String {
    "Setup".to_string()
}

pub fn teammate_idle(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("Teammate idle: {name}"),
        None => "Teammate idle".to_string(),
    }
}

pub fn task_completed(subject: Option<&str>) -> String {
    match subject {
        Some(subject) => format!("Task completed: {}", preview(subject, 60)),
        None => "Task completed".to_string(),
    }
}

pub fn config_change(description: Option<&str>) -> String {
    match description {
        Some(description) => format!("Config changed: {}", preview(description, 60)),
        None => "Config changed".to_string(),
    }
}

pub fn unknown_hook(hook_event_name: &str) -> String {
    format!("Unknown hook: {hook_event_name}")
}
