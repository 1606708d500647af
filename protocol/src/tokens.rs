//! Token accounting shared between the accumulator, store, and UI.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Token usage as reported by the harness `usage` object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cached_input_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.output_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.cached_input_tokens = self
            .cached_input_tokens
            .saturating_add(other.cached_input_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    /// Extract usage from a harness `usage` object.
    ///
    /// Missing fields read as zero; non-numeric fields are ignored.
    pub fn from_usage_value(usage: &Value) -> Self {
        Self {
            input_tokens: u64_field(usage, "input_tokens"),
            cached_input_tokens: u64_field(usage, "cache_read_input_tokens"),
            cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
        }
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Compact human display used by log-style output: `12.3K`, `1.08M`.
pub fn format_tokens_compact(value: u64) -> String {
    if value < 1_000 {
        return value.to_string();
    }

    let value_f64 = value as f64;
    let (scaled, suffix) = if value >= 1_000_000_000 {
        (value_f64 / 1_000_000_000.0, "B")
    } else if value >= 1_000_000 {
        (value_f64 / 1_000_000.0, "M")
    } else {
        (value_f64 / 1_000.0, "K")
    };

    let decimals = if scaled < 10.0 {
        2
    } else if scaled < 100.0 {
        1
    } else {
        0
    };

    let mut formatted = format!("{scaled:.decimals$}");
    if formatted.contains('.') {
        while formatted.ends_with('0') {
            formatted.pop();
        }
        if formatted.ends_with('.') {
            formatted.pop();
        }
    }

    format!("{formatted}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_harness_usage_fields() {
        let usage = TokenUsage::from_usage_value(&json!({
            "input_tokens": 12,
            "cache_read_input_tokens": 300,
            "cache_creation_input_tokens": 7,
            "output_tokens": 42,
            "service_tier": "standard",
        }));
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.cached_input_tokens, 300);
        assert_eq!(usage.cache_creation_tokens, 7);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.total(), 361);
    }

    #[test]
    fn missing_fields_read_as_zero() {
        let usage = TokenUsage::from_usage_value(&json!({"output_tokens": 5}));
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.total(), 5);
        assert!(TokenUsage::default().is_zero());
    }

    #[test]
    fn add_saturates_instead_of_overflowing() {
        let mut usage = TokenUsage {
            output_tokens: u64::MAX - 1,
            ..TokenUsage::default()
        };
        usage.add(&TokenUsage {
            output_tokens: 10,
            ..TokenUsage::default()
        });
        assert_eq!(usage.output_tokens, u64::MAX);
    }

    #[test]
    fn compact_format_scales_and_trims() {
        assert_eq!(format_tokens_compact(0), "0");
        assert_eq!(format_tokens_compact(999), "999");
        assert_eq!(format_tokens_compact(1_000), "1K");
        assert_eq!(format_tokens_compact(12_340), "12.3K");
        assert_eq!(format_tokens_compact(1_080_000), "1.08M");
        assert_eq!(format_tokens_compact(123_456_789), "123M");
        assert_eq!(format_tokens_compact(2_500_000_000), "2.5B");
    }
}
