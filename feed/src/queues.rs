//! Ordered, single-consumer queues feeding the operator dialog.
//!
//! Strict FIFO; a second request for the same tool never coalesces, so the
//! operator sees every prompt in order. Projections are captured at enqueue
//! time so a late-arriving UI can render without re-traversing the feed.

use std::collections::VecDeque;

use athena_protocol::hook::RuntimeEvent;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// What the dialog needs to render the head of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItemProjection {
    pub request_id: String,
    pub ts_ms: i64,
    pub hook: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
}

impl QueueItemProjection {
    fn from_event(event: &RuntimeEvent) -> Self {
        Self {
            request_id: event.id.clone(),
            ts_ms: event.timestamp_ms,
            hook: event.hook.as_str().to_string(),
            tool_name: event.tool_name.clone().unwrap_or_default(),
            tool_input: event.payload.get("tool_input").cloned(),
            tool_use_id: event.tool_use_id.clone(),
            suggestions: event.payload.get("suggestions").cloned(),
        }
    }
}

/// FIFO of pending request ids plus the projection for each.
#[derive(Debug, Default)]
pub struct DecisionQueue {
    items: VecDeque<QueueItemProjection>,
}

impl DecisionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, event: &RuntimeEvent) {
        self.items.push_back(QueueItemProjection::from_event(event));
    }

    /// Remove one request by id, wherever it sits in the queue.
    pub fn dequeue(&mut self, request_id: &str) -> Option<QueueItemProjection> {
        let position = self
            .items
            .iter()
            .position(|item| item.request_id == request_id)?;
        self.items.remove(position)
    }

    /// Remove every request whose id is in `ids` (connection-close pruning).
    pub fn remove_all(&mut self, ids: &[String]) {
        self.items
            .retain(|item| !ids.iter().any(|id| id == &item.request_id));
    }

    /// The head projection, or `None` when the queue is idle.
    pub fn current(&self) -> Option<&QueueItemProjection> {
        self.items.front()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
