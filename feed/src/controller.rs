//! Per-event dispatch policy, applied by the broker before the mapper runs.

use athena_protocol::decision::DecisionIntent;
use athena_protocol::decision::DecisionSource;
use athena_protocol::decision::RuntimeDecision;
use athena_protocol::hook::HookEventName;
use athena_protocol::hook::RuntimeEvent;

use crate::queues::DecisionQueue;
use crate::queues::QueueItemProjection;
use crate::rules::RuleAction;
use crate::rules::RuleSet;

/// Which operator queue a pending request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorQueue {
    Permission,
    Question,
}

/// What the broker should do with a freshly received event.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDirective {
    /// Respond synchronously (rule fast-path).
    Respond(RuntimeDecision),
    /// Queued for the operator; no auto-passthrough timer.
    AwaitOperator(OperatorQueue),
    /// Let the auto-passthrough deadline cover the request.
    ArmTimeout,
}

/// Routing policy plus the operator queues it feeds.
#[derive(Debug, Default)]
pub struct HookController {
    rules: RuleSet,
    permission_queue: DecisionQueue,
    question_queue: DecisionQueue,
}

impl HookController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Decide how to handle one event.
    ///
    /// Rule fast-path first: a matching rule on a `PreToolUse` resolves the
    /// request without operator involvement. Decision-expecting permission
    /// and question events are queued; everything else rides the timer.
    pub fn dispatch(&mut self, event: &RuntimeEvent) -> DispatchDirective {
        if event.hook == HookEventName::PreToolUse
            && let Some(tool_name) = &event.tool_name
            && let Some(rule) = self.rules.match_tool(tool_name)
        {
            let intent = match rule.action {
                RuleAction::Deny => DecisionIntent::PreToolDeny {
                    reason: format!("Blocked by rule: {}", rule.added_by),
                },
                RuleAction::Approve => DecisionIntent::PreToolAllow,
            };
            return DispatchDirective::Respond(RuntimeDecision::from_intent(
                DecisionSource::Rule,
                intent,
            ));
        }

        if event.interaction.expects_decision {
            if event.hook == HookEventName::PermissionRequest {
                self.permission_queue.enqueue(event);
                return DispatchDirective::AwaitOperator(OperatorQueue::Permission);
            }
            if event.is_question() {
                self.question_queue.enqueue(event);
                return DispatchDirective::AwaitOperator(OperatorQueue::Question);
            }
        }

        DispatchDirective::ArmTimeout
    }

    /// Drop queued requests whose connection went away.
    pub fn prune(&mut self, request_ids: &[String]) {
        self.permission_queue.remove_all(request_ids);
        self.question_queue.remove_all(request_ids);
    }

    pub fn dequeue(&mut self, queue: OperatorQueue, request_id: &str) -> Option<QueueItemProjection> {
        match queue {
            OperatorQueue::Permission => self.permission_queue.dequeue(request_id),
            OperatorQueue::Question => self.question_queue.dequeue(request_id),
        }
    }

    pub fn permission_queue(&self) -> &DecisionQueue {
        &self.permission_queue
    }

    pub fn question_queue(&self) -> &DecisionQueue {
        &self.question_queue
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleSet {
        &mut self.rules
    }
}
