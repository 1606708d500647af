//! NDJSON wire framing between the harness-side hook forwarder and Athena.
//!
//! One JSON object per `\n`-terminated line per direction. Inbound lines are
//! `hook_event` envelopes; outbound lines are `hook_result` envelopes.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Wire protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single NDJSON line in either direction.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub const KIND_HOOK_EVENT: &str = "hook_event";
pub const KIND_HOOK_RESULT: &str = "hook_result";

/// Inbound envelope framing one hook event from the harness.
///
/// Unknown top-level fields are ignored so newer forwarders can add fields
/// without breaking older supervisors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookEventEnvelope {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub kind: String,
    pub request_id: String,
    /// Unix millis at which the forwarder emitted the event.
    #[serde(default)]
    pub ts: i64,
    pub session_id: String,
    pub hook_event_name: String,
    pub payload: Value,
}

/// Outbound envelope carrying the decision for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookResultEnvelope {
    pub v: u32,
    pub kind: String,
    pub request_id: String,
    pub ts: i64,
    pub payload: ResultAction,
}

impl HookResultEnvelope {
    pub fn new(request_id: impl Into<String>, ts: i64, payload: ResultAction) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: KIND_HOOK_RESULT.to_string(),
            request_id: request_id.into(),
            ts,
            payload,
        }
    }
}

/// The action the harness-side forwarder should take for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResultAction {
    /// Let the harness proceed with its default behavior.
    Passthrough,
    /// Block the hook and surface `stderr` to the harness.
    BlockWithStderr { stderr: String },
    /// Feed a structured hook output object to the harness on stdout.
    JsonOutput { stdout_json: Value },
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing or empty request_id")]
    MissingRequestId,
    #[error("missing or empty hook_event_name")]
    MissingHookEventName,
    #[error("missing or empty session_id")]
    MissingSessionId,
    #[error("payload must be a JSON object")]
    InvalidPayload,
    #[error("line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HookEventEnvelope {
    /// Presence/shape checks for a decoded envelope.
    ///
    /// Unknown `hook_event_name` values are accepted verbatim so new hook
    /// kinds flow through as `unknown.hook` feed events instead of being
    /// dropped at the door.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.request_id.is_empty() {
            return Err(EnvelopeError::MissingRequestId);
        }
        if self.hook_event_name.is_empty() {
            return Err(EnvelopeError::MissingHookEventName);
        }
        if self.session_id.is_empty() {
            return Err(EnvelopeError::MissingSessionId);
        }
        if !self.payload.is_object() {
            return Err(EnvelopeError::InvalidPayload);
        }
        Ok(())
    }
}

/// Decode and validate one inbound NDJSON line.
pub fn decode_event_line(line: &str) -> Result<HookEventEnvelope, EnvelopeError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(EnvelopeError::LineTooLong);
    }
    let envelope: HookEventEnvelope = serde_json::from_str(line)?;
    envelope.validate()?;
    Ok(envelope)
}

/// Encode one outbound envelope as a single `\n`-terminated line.
pub fn encode_result_line(envelope: &HookResultEnvelope) -> Result<String, EnvelopeError> {
    let mut json = serde_json::to_string(envelope)?;
    json.push('\n');
    Ok(json)
}
