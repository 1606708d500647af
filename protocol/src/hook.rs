//! Hook events as received from the harness, after envelope validation.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::HookEventEnvelope;

/// Tool name the harness uses when the agent asks the operator a question.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// The set of hook event names Athena understands.
///
/// Unknown names are preserved verbatim in `Other` so a newer harness keeps
/// working against an older supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HookEventName {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    PermissionRequest,
    Stop,
    SubagentStart,
    SubagentStop,
    Notification,
    PreCompact,
    Setup,
    TeammateIdle,
    TaskCompleted,
    ConfigChange,
    Other(String),
}

impl HookEventName {
    pub fn as_str(&self) -> &str {
        match self {
            HookEventName::SessionStart => "SessionStart",
            HookEventName::SessionEnd => "SessionEnd",
            HookEventName::UserPromptSubmit => "UserPromptSubmit",
            HookEventName::PreToolUse => "PreToolUse",
            HookEventName::PostToolUse => "PostToolUse",
            HookEventName::PostToolUseFailure => "PostToolUseFailure",
            HookEventName::PermissionRequest => "PermissionRequest",
            HookEventName::Stop => "Stop",
            HookEventName::SubagentStart => "SubagentStart",
            HookEventName::SubagentStop => "SubagentStop",
            HookEventName::Notification => "Notification",
            HookEventName::PreCompact => "PreCompact",
            HookEventName::Setup => "Setup",
            HookEventName::TeammateIdle => "TeammateIdle",
            HookEventName::TaskCompleted => "TaskCompleted",
            HookEventName::ConfigChange => "ConfigChange",
            HookEventName::Other(name) => name,
        }
    }

    /// Whether this hook carries tool metadata (`tool_name` and friends).
    pub fn is_tool_event(&self) -> bool {
        matches!(
            self,
            HookEventName::PreToolUse
                | HookEventName::PostToolUse
                | HookEventName::PostToolUseFailure
                | HookEventName::PermissionRequest
        )
    }

    /// Whether the forwarder blocks on a decision for this hook by default.
    pub fn expects_decision_default(&self) -> bool {
        matches!(
            self,
            HookEventName::PreToolUse | HookEventName::PermissionRequest | HookEventName::Stop
        )
    }
}

impl From<&str> for HookEventName {
    fn from(value: &str) -> Self {
        match value {
            "SessionStart" => HookEventName::SessionStart,
            "SessionEnd" => HookEventName::SessionEnd,
            "UserPromptSubmit" => HookEventName::UserPromptSubmit,
            "PreToolUse" => HookEventName::PreToolUse,
            "PostToolUse" => HookEventName::PostToolUse,
            "PostToolUseFailure" => HookEventName::PostToolUseFailure,
            "PermissionRequest" => HookEventName::PermissionRequest,
            "Stop" => HookEventName::Stop,
            "SubagentStart" => HookEventName::SubagentStart,
            "SubagentStop" => HookEventName::SubagentStop,
            "Notification" => HookEventName::Notification,
            "PreCompact" => HookEventName::PreCompact,
            "Setup" => HookEventName::Setup,
            "TeammateIdle" => HookEventName::TeammateIdle,
            "TaskCompleted" => HookEventName::TaskCompleted,
            "ConfigChange" => HookEventName::ConfigChange,
            other => HookEventName::Other(other.to_string()),
        }
    }
}

impl From<String> for HookEventName {
    fn from(value: String) -> Self {
        HookEventName::from(value.as_str())
    }
}

impl From<HookEventName> for String {
    fn from(value: HookEventName) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for HookEventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient context the forwarder captures alongside each hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

/// How the forwarder will react to the decision for this event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionHints {
    pub expects_decision: bool,
    pub can_block: bool,
}

/// A validated hook event, owned by its dispatch for the request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeEvent {
    /// The harness request id, echoed back on the result envelope.
    pub id: String,
    pub timestamp_ms: i64,
    pub hook: HookEventName,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub context: EventContext,
    #[serde(default)]
    pub interaction: InteractionHints,
    /// The raw hook body, kept unstructured for forward compatibility.
    pub payload: Value,
}

impl RuntimeEvent {
    pub fn from_envelope(envelope: &HookEventEnvelope) -> Self {
        let hook = HookEventName::from(envelope.hook_event_name.as_str());
        let payload = &envelope.payload;

        let expects_decision = payload
            .get("expects_decision")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| hook.expects_decision_default());

        Self {
            id: envelope.request_id.clone(),
            timestamp_ms: envelope.ts,
            session_id: envelope.session_id.clone(),
            tool_name: string_field(payload, "tool_name"),
            tool_use_id: string_field(payload, "tool_use_id"),
            agent_id: string_field(payload, "agent_id"),
            agent_type: string_field(payload, "agent_type"),
            context: EventContext {
                cwd: string_field(payload, "cwd"),
                transcript_path: string_field(payload, "transcript_path"),
            },
            interaction: InteractionHints {
                expects_decision,
                can_block: hook.expects_decision_default(),
            },
            payload: payload.clone(),
            hook,
        }
    }

    /// Whether this event is the agent asking the operator a question.
    pub fn is_question(&self) -> bool {
        self.hook == HookEventName::PreToolUse
            && self.tool_name.as_deref() == Some(ASK_USER_QUESTION_TOOL)
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
