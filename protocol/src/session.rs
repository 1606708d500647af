//! Session, run, and actor state tracked by the feed mapper.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// What started (or restarted) a harness session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionSource {
    #[default]
    Startup,
    Resume,
    Clear,
    Compact,
    Other(String),
}

impl SessionSource {
    pub fn as_str(&self) -> &str {
        match self {
            SessionSource::Startup => "startup",
            SessionSource::Resume => "resume",
            SessionSource::Clear => "clear",
            SessionSource::Compact => "compact",
            SessionSource::Other(source) => source,
        }
    }

    /// Sources that re-enter an existing conversation and therefore open a
    /// fresh run immediately.
    pub fn reopens_run(&self) -> bool {
        matches!(
            self,
            SessionSource::Resume | SessionSource::Clear | SessionSource::Compact
        )
    }
}

impl From<&str> for SessionSource {
    fn from(value: &str) -> Self {
        match value {
            "startup" => SessionSource::Startup,
            "resume" => SessionSource::Resume,
            "clear" => SessionSource::Clear,
            "compact" => SessionSource::Compact,
            other => SessionSource::Other(other.to_string()),
        }
    }
}

impl From<String> for SessionSource {
    fn from(value: String) -> Self {
        SessionSource::from(value.as_str())
    }
}

impl From<SessionSource> for String {
    fn from(value: SessionSource) -> Self {
        value.as_str().to_string()
    }
}

/// One harness process/resume cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    pub source: SessionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTriggerKind {
    UserPromptSubmit,
    Resume,
    Clear,
    Compact,
    Other,
}

impl RunTriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTriggerKind::UserPromptSubmit => "user_prompt_submit",
            RunTriggerKind::Resume => "resume",
            RunTriggerKind::Clear => "clear",
            RunTriggerKind::Compact => "compact",
            RunTriggerKind::Other => "other",
        }
    }
}

impl From<&SessionSource> for RunTriggerKind {
    fn from(source: &SessionSource) -> Self {
        match source {
            SessionSource::Resume => RunTriggerKind::Resume,
            SessionSource::Clear => RunTriggerKind::Clear,
            SessionSource::Compact => RunTriggerKind::Compact,
            SessionSource::Startup | SessionSource::Other(_) => RunTriggerKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTrigger {
    #[serde(rename = "type")]
    pub kind: RunTriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Blocked,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub tool_uses: u64,
    pub tool_failures: u64,
    pub permission_requests: u64,
    pub blocks: u64,
}

/// Actors participating in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunActors {
    pub root_agent_id: String,
    #[serde(default)]
    pub subagent_ids: Vec<String>,
}

/// One logical request-response cycle within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Formatted as `{session_id}:R{run_seq}`.
    pub run_id: String,
    pub session_id: String,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub actors: RunActors,
    pub counters: RunCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Agent,
    Subagent,
    System,
}

/// A logical speaker in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub kind: ActorKind,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_actor_id: Option<String>,
}

pub const ACTOR_USER: &str = "user";
pub const ACTOR_SYSTEM: &str = "system";
pub const ACTOR_ROOT_AGENT: &str = "agent:root";

pub fn subagent_actor_id(agent_id: &str) -> String {
    format!("subagent:{agent_id}")
}

/// The three actors every feed starts with.
pub fn builtin_actors() -> Vec<Actor> {
    vec![
        Actor {
            actor_id: ACTOR_USER.to_string(),
            kind: ActorKind::User,
            display_name: "You".to_string(),
            agent_type: None,
            parent_actor_id: None,
        },
        Actor {
            actor_id: ACTOR_ROOT_AGENT.to_string(),
            kind: ActorKind::Agent,
            display_name: "Agent".to_string(),
            agent_type: None,
            parent_actor_id: None,
        },
        Actor {
            actor_id: ACTOR_SYSTEM.to_string(),
            kind: ActorKind::System,
            display_name: "System".to_string(),
            agent_type: None,
            parent_actor_id: None,
        },
    ]
}
