//! Id generation.
//!
//! Ids only need intra-process uniqueness; nothing here is cryptographic.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Identifies one supervisor instance; selects the UDS path the harness dials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// A fresh time-ordered id for this process.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Use a supervisor-chosen id (the process id is acceptable).
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fresh Athena session id (distinct from the harness's own session ids).
pub fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generator for UI-originated synthetic ids: monotonic prefix plus a random
/// suffix so ids stay unique even across generator restarts.
#[derive(Debug, Default)]
pub struct RequestIdGen {
    counter: AtomicU64,
}

impl RequestIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{n}-{}", &suffix[..8])
    }
}
