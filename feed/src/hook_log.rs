//! Operational NDJSON log of hook traffic.
//!
//! One line per received event and per sent result, under
//! `{projectDir}/.claude/logs/hooks.jsonl`. This log is diagnostics only: it
//! is not part of the durable feed and may be truncated or rotated
//! independently, so appends are best-effort.

use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use athena_protocol::envelope::ResultAction;
use athena_protocol::hook::RuntimeEvent;
use serde::Deserialize;
use serde::Serialize;

pub const HOOK_LOG_RELATIVE_PATH: &str = ".claude/logs/hooks.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookLogLine {
    Received {
        request_id: String,
        event: String,
        ts: i64,
    },
    Responded {
        request_id: String,
        event: String,
        ts: i64,
        action: ResultAction,
    },
}

/// Best-effort appender for the hooks log.
#[derive(Debug, Clone)]
pub struct HookLog {
    path: PathBuf,
}

impl HookLog {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(HOOK_LOG_RELATIVE_PATH),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn received(&self, event: &RuntimeEvent) {
        self.append(&HookLogLine::Received {
            request_id: event.id.clone(),
            event: event.hook.as_str().to_string(),
            ts: event.timestamp_ms,
        });
    }

    pub fn responded(&self, request_id: &str, event: &str, ts: i64, action: &ResultAction) {
        self.append(&HookLogLine::Responded {
            request_id: request_id.to_string(),
            event: event.to_string(),
            ts,
            action: action.clone(),
        });
    }

    fn append(&self, line: &HookLogLine) {
        if let Err(err) = self.try_append(line) {
            tracing::debug!(path = %self.path.display(), "hooks log append failed: {err:#}");
        }
    }

    fn try_append(&self, line: &HookLogLine) -> anyhow::Result<()> {
        let Some(parent) = self.path.parent() else {
            anyhow::bail!("invalid hooks log path: {}", self.path.display());
        };
        std::fs::create_dir_all(parent)?;

        let mut json = serde_json::to_string(line)?;
        json.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
