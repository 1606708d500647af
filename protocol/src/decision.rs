//! Decisions flowing back to the harness, and their harness-facing shapes.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::envelope::ResultAction;

/// Coarse shape of the decision envelope payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Json,
    Passthrough,
    BlockWithStderr,
}

/// Who produced the decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    User,
    Rule,
    Timeout,
    Auto,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::User => "user",
            DecisionSource::Rule => "rule",
            DecisionSource::Timeout => "timeout",
            DecisionSource::Auto => "auto",
        }
    }
}

/// Semantic intent behind a `json` decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionIntent {
    PreToolAllow,
    PreToolDeny { reason: String },
    PermissionAllow,
    PermissionDeny { reason: String },
    QuestionAnswer { answers: BTreeMap<String, String> },
}

/// A resolved decision for one pending hook request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeDecision {
    pub kind: DecisionKind,
    pub source: DecisionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<DecisionIntent>,
    /// Pre-built `stdout_json` body, used when no intent applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RuntimeDecision {
    pub fn passthrough(source: DecisionSource) -> Self {
        Self {
            kind: DecisionKind::Passthrough,
            source,
            intent: None,
            data: None,
            reason: None,
        }
    }

    pub fn block(source: DecisionSource, reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::BlockWithStderr,
            source,
            intent: None,
            data: None,
            reason: Some(reason.into()),
        }
    }

    pub fn from_intent(source: DecisionSource, intent: DecisionIntent) -> Self {
        Self {
            kind: DecisionKind::Json,
            source,
            intent: Some(intent),
            data: None,
            reason: None,
        }
    }

    /// Render the harness-facing result payload for this decision.
    pub fn to_result_action(&self) -> ResultAction {
        match self.kind {
            DecisionKind::Passthrough => ResultAction::Passthrough,
            DecisionKind::BlockWithStderr => ResultAction::BlockWithStderr {
                stderr: self.reason.clone().unwrap_or_default(),
            },
            DecisionKind::Json => {
                let stdout_json = match &self.intent {
                    Some(intent) => intent.to_stdout_json(),
                    None => self.data.clone().unwrap_or_else(|| json!({})),
                };
                ResultAction::JsonOutput { stdout_json }
            }
        }
    }
}

impl DecisionIntent {
    /// The `stdout_json` object the harness expects for this intent.
    pub fn to_stdout_json(&self) -> Value {
        match self {
            DecisionIntent::PreToolAllow => json!({
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "permissionDecision": "allow",
                }
            }),
            DecisionIntent::PreToolDeny { reason } => json!({
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "permissionDecision": "deny",
                    "permissionDecisionReason": reason,
                }
            }),
            DecisionIntent::PermissionAllow => json!({
                "hookSpecificOutput": {
                    "hookEventName": "PermissionRequest",
                    "decision": {"behavior": "allow"},
                }
            }),
            DecisionIntent::PermissionDeny { reason } => json!({
                "hookSpecificOutput": {
                    "hookEventName": "PermissionRequest",
                    "decision": {"behavior": "deny", "message": reason},
                }
            }),
            DecisionIntent::QuestionAnswer { answers } => {
                let mut lines = Vec::with_capacity(answers.len());
                for (question, answer) in answers {
                    lines.push(format!("Q: {question}\nA: {answer}"));
                }
                json!({
                    "hookSpecificOutput": {
                        "hookEventName": "PreToolUse",
                        "permissionDecision": "allow",
                        "updatedInput": {"answers": answers},
                        "additionalContext": lines.join("\n"),
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pre_tool_shapes_match_harness_contract() {
        let allow = DecisionIntent::PreToolAllow.to_stdout_json();
        assert_eq!(
            allow["hookSpecificOutput"]["permissionDecision"],
            "allow"
        );
        assert_eq!(allow["hookSpecificOutput"]["hookEventName"], "PreToolUse");

        let deny = DecisionIntent::PreToolDeny {
            reason: "Blocked by rule: test".to_string(),
        }
        .to_stdout_json();
        assert_eq!(deny["hookSpecificOutput"]["permissionDecision"], "deny");
        assert_eq!(
            deny["hookSpecificOutput"]["permissionDecisionReason"],
            "Blocked by rule: test"
        );
    }

    #[test]
    fn permission_shapes_carry_behavior() {
        let allow = DecisionIntent::PermissionAllow.to_stdout_json();
        assert_eq!(
            allow["hookSpecificOutput"]["decision"]["behavior"],
            "allow"
        );

        let deny = DecisionIntent::PermissionDeny {
            reason: "nope".to_string(),
        }
        .to_stdout_json();
        assert_eq!(deny["hookSpecificOutput"]["decision"]["behavior"], "deny");
        assert_eq!(deny["hookSpecificOutput"]["decision"]["message"], "nope");
    }

    #[test]
    fn question_answer_enumerates_pairs_in_order() {
        let mut answers = BTreeMap::new();
        answers.insert("Deploy now?".to_string(), "yes".to_string());
        answers.insert("Which env?".to_string(), "staging".to_string());

        let output = DecisionIntent::QuestionAnswer { answers }.to_stdout_json();
        let hook_output = &output["hookSpecificOutput"];
        assert_eq!(hook_output["permissionDecision"], "allow");
        assert_eq!(
            hook_output["updatedInput"]["answers"]["Which env?"],
            "staging"
        );
        assert_eq!(
            hook_output["additionalContext"],
            "Q: Deploy now?\nA: yes\nQ: Which env?\nA: staging"
        );
    }

    #[test]
    fn decision_without_intent_uses_data_or_empty_object() {
        let with_data = RuntimeDecision {
            kind: DecisionKind::Json,
            source: DecisionSource::User,
            intent: None,
            data: Some(serde_json::json!({"custom": true})),
            reason: None,
        };
        assert_eq!(
            with_data.to_result_action(),
            ResultAction::JsonOutput {
                stdout_json: serde_json::json!({"custom": true})
            }
        );

        let block = RuntimeDecision::block(DecisionSource::User, "stop");
        assert_eq!(
            block.to_result_action(),
            ResultAction::BlockWithStderr {
                stderr: "stop".to_string()
            }
        );
    }
}
