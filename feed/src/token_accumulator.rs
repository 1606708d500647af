//! Incremental parser of the harness stdout stream-json.
//!
//! The harness prints one JSON object per line: `assistant` lines carry the
//! per-message `usage` object, and the final `result` line carries the
//! cumulative totals for the run. Non-JSON lines (panics, stray prints) are
//! tolerated and skipped.

use athena_protocol::tokens::TokenUsage;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct TokenAccumulator {
    /// Running sum of per-message usage across the current harness run.
    accumulated: TokenUsage,
    /// Usage delta of the most recent assistant message.
    last_turn: TokenUsage,
    /// Cumulative totals from the `result` line, when one was seen.
    result_total: Option<TokenUsage>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u64>,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Returns `true` when the line updated any total.
    pub fn observe_line(&mut self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return false;
        };
        self.observe_value(&value)
    }

    fn observe_value(&mut self, value: &Value) -> bool {
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let Some(usage) = value.get("message").and_then(|message| message.get("usage"))
                else {
                    return false;
                };
                let delta = TokenUsage::from_usage_value(usage);
                if delta.is_zero() {
                    return false;
                }
                self.last_turn = delta;
                self.accumulated.add(&delta);
                true
            }
            Some("result") => {
                let mut updated = false;
                if let Some(usage) = value.get("usage") {
                    let total = TokenUsage::from_usage_value(usage);
                    if !total.is_zero() {
                        self.result_total = Some(total);
                        updated = true;
                    }
                }
                if let Some(cost) = value.get("total_cost_usd").and_then(Value::as_f64) {
                    self.total_cost_usd = Some(cost);
                    updated = true;
                }
                if let Some(turns) = value.get("num_turns").and_then(Value::as_u64) {
                    self.num_turns = Some(turns);
                    updated = true;
                }
                updated
            }
            _ => false,
        }
    }

    /// Usage delta of the most recent assistant message.
    pub fn last_turn(&self) -> TokenUsage {
        self.last_turn
    }

    /// The best cumulative figure so far: the harness result totals when
    /// available, else the sum of observed per-message deltas.
    pub fn cumulative(&self) -> TokenUsage {
        self.result_total.unwrap_or(self.accumulated)
    }

    pub fn total_cost_usd(&self) -> Option<f64> {
        self.total_cost_usd
    }

    pub fn num_turns(&self) -> Option<u64> {
        self.num_turns
    }

    /// Final usage for this harness run, persisted on exit.
    pub fn finish(self) -> TokenUsage {
        self.cumulative()
    }
}
