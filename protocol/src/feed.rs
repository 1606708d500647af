//! Typed, sequenced feed events.
//!
//! Feed events are produced exclusively by the feed mapper and are immutable
//! once emitted. `FeedBody` is the tagged variant over `kind`; the per-kind
//! payload travels in the variant rather than behind a downcast.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::session::RunCounters;
use crate::session::RunStatus;
use crate::session::RunTrigger;
use crate::session::SessionSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    SessionStart,
    SessionEnd,
    RunStart,
    RunEnd,
    UserPrompt,
    ToolPre,
    ToolPost,
    ToolFailure,
    PermissionRequest,
    PermissionDecision,
    StopRequest,
    StopDecision,
    SubagentStart,
    SubagentStop,
    AgentMessage,
    Notification,
    CompactPre,
    Setup,
    TeammateIdle,
    TaskCompleted,
    ConfigChange,
    UnknownHook,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::SessionStart => "session.start",
            FeedKind::SessionEnd => "session.end",
            FeedKind::RunStart => "run.start",
            FeedKind::RunEnd => "run.end",
            FeedKind::UserPrompt => "user.prompt",
            FeedKind::ToolPre => "tool.pre",
            FeedKind::ToolPost => "tool.post",
            FeedKind::ToolFailure => "tool.failure",
            FeedKind::PermissionRequest => "permission.request",
            FeedKind::PermissionDecision => "permission.decision",
            FeedKind::StopRequest => "stop.request",
            FeedKind::StopDecision => "stop.decision",
            FeedKind::SubagentStart => "subagent.start",
            FeedKind::SubagentStop => "subagent.stop",
            FeedKind::AgentMessage => "agent.message",
            FeedKind::Notification => "notification",
            FeedKind::CompactPre => "compact.pre",
            FeedKind::Setup => "setup",
            FeedKind::TeammateIdle => "teammate.idle",
            FeedKind::TaskCompleted => "task.completed",
            FeedKind::ConfigChange => "config.change",
            FeedKind::UnknownHook => "unknown.hook",
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedLevel {
    #[default]
    Info,
    Error,
    Debug,
}

/// Correlation pointers back to the originating hook and related events.
///
/// These are plain id strings, never embedded events; consumers resolve them
/// against their own event arena.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed_default: Option<bool>,
}

/// How a pending request was resolved, as recorded in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision_type", rename_all = "snake_case")]
pub enum DecisionRecord {
    Allow,
    Deny { message: String },
    Block { reason: String },
    NoOpinion { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartData {
    pub source: SessionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEndData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartData {
    pub trigger: RunTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEndData {
    pub status: RunStatus,
    pub counters: RunCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPromptData {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPreData {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPostData {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFailureData {
    pub tool_name: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_interrupt: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequestData {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecisionData {
    #[serde(flatten)]
    pub decision: DecisionRecord,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_hook_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecisionData {
    #[serde(flatten)]
    pub decision: DecisionRecord,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentStartData {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentStopData {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_transcript_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMessageData {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactPreData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupData {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeammateIdleData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teammate_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_subject: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownHookData {
    pub hook_event_name: String,
}

/// Kind tag plus the kind-specific record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum FeedBody {
    #[serde(rename = "session.start")]
    SessionStart(SessionStartData),
    #[serde(rename = "session.end")]
    SessionEnd(SessionEndData),
    #[serde(rename = "run.start")]
    RunStart(RunStartData),
    #[serde(rename = "run.end")]
    RunEnd(RunEndData),
    #[serde(rename = "user.prompt")]
    UserPrompt(UserPromptData),
    #[serde(rename = "tool.pre")]
    ToolPre(ToolPreData),
    #[serde(rename = "tool.post")]
    ToolPost(ToolPostData),
    #[serde(rename = "tool.failure")]
    ToolFailure(ToolFailureData),
    #[serde(rename = "permission.request")]
    PermissionRequest(PermissionRequestData),
    #[serde(rename = "permission.decision")]
    PermissionDecision(PermissionDecisionData),
    #[serde(rename = "stop.request")]
    StopRequest(StopRequestData),
    #[serde(rename = "stop.decision")]
    StopDecision(StopDecisionData),
    #[serde(rename = "subagent.start")]
    SubagentStart(SubagentStartData),
    #[serde(rename = "subagent.stop")]
    SubagentStop(SubagentStopData),
    #[serde(rename = "agent.message")]
    AgentMessage(AgentMessageData),
    #[serde(rename = "notification")]
    Notification(NotificationData),
    #[serde(rename = "compact.pre")]
    CompactPre(CompactPreData),
    #[serde(rename = "setup")]
    Setup(SetupData),
    #[serde(rename = "teammate.idle")]
    TeammateIdle(TeammateIdleData),
    #[serde(rename = "task.completed")]
    TaskCompleted(TaskCompletedData),
    #[serde(rename = "config.change")]
    ConfigChange(ConfigChangeData),
    #[serde(rename = "unknown.hook")]
    UnknownHook(UnknownHookData),
}

impl FeedBody {
    pub fn kind(&self) -> FeedKind {
        match self {
            FeedBody::SessionStart(_) => FeedKind::SessionStart,
            FeedBody::SessionEnd(_) => FeedKind::SessionEnd,
            FeedBody::RunStart(_) => FeedKind::RunStart,
            FeedBody::RunEnd(_) => FeedKind::RunEnd,
            FeedBody::UserPrompt(_) => FeedKind::UserPrompt,
            FeedBody::ToolPre(_) => FeedKind::ToolPre,
            FeedBody::ToolPost(_) => FeedKind::ToolPost,
            FeedBody::ToolFailure(_) => FeedKind::ToolFailure,
            FeedBody::PermissionRequest(_) => FeedKind::PermissionRequest,
            FeedBody::PermissionDecision(_) => FeedKind::PermissionDecision,
            FeedBody::StopRequest(_) => FeedKind::StopRequest,
            FeedBody::StopDecision(_) => FeedKind::StopDecision,
            FeedBody::SubagentStart(_) => FeedKind::SubagentStart,
            FeedBody::SubagentStop(_) => FeedKind::SubagentStop,
            FeedBody::AgentMessage(_) => FeedKind::AgentMessage,
            FeedBody::Notification(_) => FeedKind::Notification,
            FeedBody::CompactPre(_) => FeedKind::CompactPre,
            FeedBody::Setup(_) => FeedKind::Setup,
            FeedBody::TeammateIdle(_) => FeedKind::TeammateIdle,
            FeedBody::TaskCompleted(_) => FeedKind::TaskCompleted,
            FeedBody::ConfigChange(_) => FeedKind::ConfigChange,
            FeedBody::UnknownHook(_) => FeedKind::UnknownHook,
        }
    }
}

/// One immutable, sequenced entry in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// `{run_id}:E{n}` where `n` is run-scoped and human-readable.
    pub event_id: String,
    /// Strictly monotonic across the mapper's lifetime, including bootstrap.
    pub seq: u64,
    pub ts_ms: i64,
    pub session_id: String,
    pub run_id: String,
    pub level: FeedLevel,
    pub actor_id: String,
    #[serde(default)]
    pub cause: Cause,
    pub title: String,
    #[serde(flatten)]
    pub body: FeedBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiHints>,
}

impl FeedEvent {
    pub fn kind(&self) -> FeedKind {
        self.body.kind()
    }
}

/// Format the run-scoped event id.
pub fn format_event_id(run_id: &str, run_scoped_index: u64) -> String {
    format!("{run_id}:E{run_scoped_index}")
}

/// Format the run id for a session-scoped run counter.
pub fn format_run_id(session_id: &str, run_seq: u32) -> String {
    format!("{session_id}:R{run_seq}")
}
