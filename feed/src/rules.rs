//! Operator-configured tool rules.
//!
//! Rules are an ordered list; matching applies deny precedence (the first
//! matching deny wins) before the first matching approve. Duplicate or
//! contradictory rules are the caller's responsibility.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRule {
    pub id: String,
    /// Exact tool name, or a suffix wildcard such as `mcp__github__*`.
    pub tool_name: String,
    pub action: RuleAction,
    pub added_by: String,
}

impl HookRule {
    pub fn matches(&self, tool_name: &str) -> bool {
        match self.tool_name.strip_suffix('*') {
            Some(prefix) => tool_name.starts_with(prefix),
            None => self.tool_name == tool_name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<HookRule>,
    next_id: u64,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<HookRule>) -> Self {
        let next_id = rules.len() as u64;
        Self { rules, next_id }
    }

    /// Append a rule, assigning an id.
    pub fn add(&mut self, tool_name: impl Into<String>, action: RuleAction, added_by: impl Into<String>) -> HookRule {
        let rule = HookRule {
            id: format!("rule-{}", self.next_id),
            tool_name: tool_name.into(),
            action,
            added_by: added_by.into(),
        };
        self.next_id += 1;
        self.rules.push(rule.clone());
        rule
    }

    pub fn remove(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != rule_id);
        self.rules.len() != before
    }

    /// Snapshot for readers inside the broker dispatch path.
    pub fn rules(&self) -> Vec<HookRule> {
        self.rules.clone()
    }

    /// First matching deny, else first matching approve, else none.
    pub fn match_tool(&self, tool_name: &str) -> Option<&HookRule> {
        self.rules
            .iter()
            .find(|rule| rule.action == RuleAction::Deny && rule.matches(tool_name))
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|rule| rule.action == RuleAction::Approve && rule.matches(tool_name))
            })
    }
}
