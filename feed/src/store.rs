//! Durable, append-only session store.
//!
//! One JSONL file per Athena session. Every line is a tagged record; replay
//! order is append order. Failures to append are returned to the caller so
//! the facade can mark the session degraded rather than silently diverging
//! from the persisted source of truth.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use athena_protocol::feed::FeedEvent;
use athena_protocol::hook::RuntimeEvent;
use athena_protocol::tokens::TokenUsage;
use serde::Deserialize;
use serde::Serialize;

use crate::mapper::MapperBootstrap;

/// Name of the JSONL file inside a session directory.
pub const STORE_FILENAME: &str = "store.jsonl";

/// A single append-only JSONL entry in `store.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreLine {
    Meta {
        session_id: String,
        created_at_ms: i64,
    },
    Runtime {
        event: RuntimeEvent,
    },
    Feed {
        events: Vec<FeedEvent>,
    },
    Tokens {
        adapter_session_id: String,
        tokens: TokenUsage,
    },
}

/// Where appended lines land.
#[derive(Debug, Clone)]
pub enum StoreBacking {
    /// In-memory log, the `:memory:` analog used by tests.
    Memory,
    /// Append-only file on disk.
    File(PathBuf),
}

/// What restore() replays from the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoredSession {
    pub feed_events: Vec<FeedEvent>,
    pub adapter_session_ids: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug)]
pub struct SessionStore {
    session_id: String,
    backing: StoreBacking,
    /// Mirror of every appended line, also the storage for `Memory`.
    lines: Vec<StoreLine>,
    /// Last-known token snapshot per harness-process session id.
    tokens: BTreeMap<String, TokenUsage>,
    created_at_ms: i64,
    degraded_reason: Option<String>,
    closed: bool,
}

impl SessionStore {
    /// Open (or create) the store for a session.
    ///
    /// An existing file is replayed into memory so `restore` and
    /// `to_bootstrap` see prior process history.
    pub fn open(
        session_id: impl Into<String>,
        backing: StoreBacking,
        created_at_ms: i64,
    ) -> anyhow::Result<Self> {
        let session_id = session_id.into();
        let mut store = Self {
            session_id: session_id.clone(),
            backing,
            lines: Vec::new(),
            tokens: BTreeMap::new(),
            created_at_ms,
            degraded_reason: None,
            closed: false,
        };

        let existing = match &store.backing {
            StoreBacking::Memory => Vec::new(),
            StoreBacking::File(path) if path.exists() => read_lines(path)?,
            StoreBacking::File(_) => Vec::new(),
        };

        if existing.is_empty() {
            let meta = StoreLine::Meta {
                session_id,
                created_at_ms,
            };
            store.append(&[meta])?;
        } else {
            for line in &existing {
                store.absorb(line);
            }
            store.lines = existing;
        }

        Ok(store)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }

    /// The first degradation reason, if any. Sticky for the store's lifetime.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded_reason.as_deref()
    }

    /// Sticky: later calls never overwrite the first reason.
    pub fn mark_degraded(&mut self, reason: impl Into<String>) {
        if self.degraded_reason.is_none() {
            let reason = reason.into();
            tracing::warn!(session_id = %self.session_id, %reason, "session store degraded");
            self.degraded_reason = Some(reason);
        }
    }

    /// Append a runtime event and its derived feed events atomically: both
    /// lines are written in one buffered write, or the call fails and
    /// nothing is recorded.
    pub fn record_event(
        &mut self,
        event: &RuntimeEvent,
        derived: &[FeedEvent],
    ) -> anyhow::Result<()> {
        let lines = [
            StoreLine::Runtime {
                event: event.clone(),
            },
            StoreLine::Feed {
                events: derived.to_vec(),
            },
        ];
        self.append(&lines)
    }

    /// Append feed-only events (decision events).
    pub fn record_feed_events(&mut self, events: &[FeedEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.append(&[StoreLine::Feed {
            events: events.to_vec(),
        }])
    }

    /// Upsert the last-known token snapshot for one harness process.
    pub fn record_tokens(
        &mut self,
        adapter_session_id: impl Into<String>,
        tokens: TokenUsage,
    ) -> anyhow::Result<()> {
        self.append(&[StoreLine::Tokens {
            adapter_session_id: adapter_session_id.into(),
            tokens,
        }])
    }

    /// Replay the log in append order.
    ///
    /// Reads keep working after degradation.
    pub fn restore(&self) -> RestoredSession {
        let mut restored = RestoredSession {
            created_at_ms: self.created_at_ms,
            ..RestoredSession::default()
        };
        for line in &self.lines {
            match line {
                StoreLine::Meta { created_at_ms, .. } => {
                    restored.created_at_ms = *created_at_ms;
                }
                StoreLine::Feed { events } => {
                    restored.feed_events.extend(events.iter().cloned());
                }
                StoreLine::Runtime { event } => {
                    if !restored.adapter_session_ids.contains(&event.session_id) {
                        restored.adapter_session_ids.push(event.session_id.clone());
                    }
                }
                StoreLine::Tokens {
                    adapter_session_id, ..
                } => {
                    if !restored.adapter_session_ids.contains(adapter_session_id) {
                        restored
                            .adapter_session_ids
                            .push(adapter_session_id.clone());
                    }
                }
            }
        }
        restored
    }

    /// Sum of per-adapter token snapshots at restore time.
    pub fn restored_tokens(&self) -> Option<TokenUsage> {
        if self.tokens.is_empty() {
            return None;
        }
        let mut total = TokenUsage::default();
        for tokens in self.tokens.values() {
            total.add(tokens);
        }
        Some(total)
    }

    /// The mapper bootstrap for this session, or `None` when no feed events
    /// were ever recorded.
    pub fn to_bootstrap(&self) -> Option<MapperBootstrap> {
        let restored = self.restore();
        if restored.feed_events.is_empty() {
            return None;
        }
        Some(MapperBootstrap {
            feed_events: restored.feed_events,
            adapter_session_ids: restored.adapter_session_ids,
            created_at_ms: restored.created_at_ms,
        })
    }

    /// Release the handle. Appends after close fail.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn absorb(&mut self, line: &StoreLine) {
        match line {
            StoreLine::Meta { created_at_ms, .. } => self.created_at_ms = *created_at_ms,
            StoreLine::Tokens {
                adapter_session_id,
                tokens,
            } => {
                self.tokens.insert(adapter_session_id.clone(), *tokens);
            }
            StoreLine::Runtime { .. } | StoreLine::Feed { .. } => {}
        }
    }

    fn append(&mut self, lines: &[StoreLine]) -> anyhow::Result<()> {
        anyhow::ensure!(!self.closed, "session store is closed");

        if let StoreBacking::File(path) = &self.backing {
            let mut buffer = String::new();
            for line in lines {
                let json = serde_json::to_string(line)
                    .with_context(|| format!("serialize store line for {}", path.display()))?;
                buffer.push_str(&json);
                buffer.push('\n');
            }
            append_text(path, &buffer)?;
        }

        for line in lines {
            self.absorb(line);
            self.lines.push(line.clone());
        }
        Ok(())
    }
}

fn append_text(path: &Path, text: &str) -> anyhow::Result<()> {
    let Some(parent) = path.parent() else {
        anyhow::bail!("invalid store path (no parent): {}", path.display());
    };
    std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.flush().with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

/// Read and parse an entire store file.
pub fn read_lines(path: &Path) -> anyhow::Result<Vec<StoreLine>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in std::io::BufRead::lines(reader).enumerate() {
        let line_number = idx + 1;
        let line =
            line.with_context(|| format!("read line {line_number} from {}", path.display()))?;
        if line.trim().is_empty() {
            anyhow::bail!("empty JSONL line {line_number} in {}", path.display());
        }
        let parsed = serde_json::from_str::<StoreLine>(&line)
            .with_context(|| format!("parse store JSONL line {line_number}: {line}"))?;
        out.push(parsed);
    }
    Ok(out)
}
