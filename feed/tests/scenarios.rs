//! End-to-end scenarios driving the controller, mapper, store, queues, and
//! broker together the way a live session does.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use athena_feed::broker::BrokerConfig;
use athena_feed::broker::BrokerNotice;
use athena_feed::broker::HookBroker;
use athena_feed::broker::HookDispatcher;
use athena_feed::controller::DispatchDirective;
use athena_feed::controller::HookController;
use athena_feed::mapper::FeedMapper;
use athena_feed::rules::RuleAction;
use athena_feed::rules::RuleSet;
use athena_feed::store::SessionStore;
use athena_feed::store::StoreBacking;
use athena_protocol::InstanceId;
use athena_protocol::decision::DecisionIntent;
use athena_protocol::decision::DecisionSource;
use athena_protocol::decision::RuntimeDecision;
use athena_protocol::envelope::HookEventEnvelope;
use athena_protocol::envelope::HookResultEnvelope;
use athena_protocol::envelope::ResultAction;
use athena_protocol::feed::FeedEvent;
use athena_protocol::feed::FeedKind;
use athena_protocol::hook::RuntimeEvent;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::Duration;
use tokio::time::timeout;

fn runtime_event(request_id: &str, hook: &str, payload: Value) -> RuntimeEvent {
    RuntimeEvent::from_envelope(&HookEventEnvelope {
        v: 1,
        kind: "hook_event".to_string(),
        request_id: request_id.to_string(),
        ts: 1_700_000_000_000,
        session_id: "adapter-1".to_string(),
        hook_event_name: hook.to_string(),
        payload,
    })
}

fn kinds(events: &[FeedEvent]) -> Vec<FeedKind> {
    events.iter().map(FeedEvent::kind).collect()
}

fn assert_feed_invariants(events: &[FeedEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].seq < pair[1].seq,
            "seq must be strictly monotonic: {} then {}",
            pair[0].seq,
            pair[1].seq
        );
    }
    let mut ids = HashSet::new();
    for event in events {
        assert!(
            ids.insert(event.event_id.as_str()),
            "duplicate event_id {}",
            event.event_id
        );
    }
}

/// S1 — a deny rule answers a PreToolUse synchronously and the feed records
/// only the tool.pre (no synthesized permission.decision).
#[test]
fn s1_rule_based_deny() {
    let mut rules = RuleSet::new();
    rules.add("Bash", RuleAction::Deny, "test");
    let mut controller = HookController::with_rules(rules);
    let mut mapper = FeedMapper::new();
    let mut store = SessionStore::open("athena-s1", StoreBacking::Memory, 0).expect("open");

    let mut feed = Vec::new();
    for event in [
        runtime_event("rs", "SessionStart", json!({"source": "startup"})),
        runtime_event("rp", "UserPromptSubmit", json!({"prompt": "x"})),
        runtime_event(
            "r1",
            "PreToolUse",
            json!({"tool_name": "Bash", "tool_use_id": "t1"}),
        ),
    ] {
        let directive = controller.dispatch(&event);
        let derived = mapper.map_event(&event);
        store.record_event(&event, &derived).expect("record");
        feed.extend(derived);

        if event.id == "r1" {
            let DispatchDirective::Respond(decision) = directive else {
                panic!("expected rule decision for r1, got {directive:?}");
            };
            assert_eq!(
                decision.intent,
                Some(DecisionIntent::PreToolDeny {
                    reason: "Blocked by rule: test".to_string()
                })
            );
            // Mapper records no decision event for a PreToolUse request.
            assert!(mapper.map_decision("r1", &decision).is_none());
        }
    }

    assert_eq!(
        kinds(&feed),
        vec![
            FeedKind::SessionStart,
            FeedKind::RunStart,
            FeedKind::UserPrompt,
            FeedKind::ToolPre,
        ]
    );
    assert_feed_invariants(&feed);
    assert_eq!(store.restore().feed_events, feed);
}

/// S2 — operator allow resolves the queued permission and the decision event
/// points back at the request.
#[test]
fn s2_operator_allow_with_rule_persistence() {
    let mut controller = HookController::new();
    let mut mapper = FeedMapper::new();
    let mut store = SessionStore::open("athena-s2", StoreBacking::Memory, 0).expect("open");

    let mut feed = Vec::new();
    for event in [
        runtime_event("rs", "SessionStart", json!({})),
        runtime_event("rp", "UserPromptSubmit", json!({"prompt": "x"})),
        runtime_event(
            "r2",
            "PermissionRequest",
            json!({"tool_name": "Write", "tool_use_id": "t2", "tool_input": {"path": "a"}}),
        ),
    ] {
        controller.dispatch(&event);
        let derived = mapper.map_event(&event);
        store.record_event(&event, &derived).expect("record");
        feed.extend(derived);
    }
    assert_eq!(controller.permission_queue().count(), 1);

    // Operator picks always-allow: the dialog dequeues, appends the rule,
    // and resolves the request.
    let projection = controller
        .dequeue(athena_feed::controller::OperatorQueue::Permission, "r2")
        .expect("queued item");
    controller
        .rules_mut()
        .add(projection.tool_name, RuleAction::Approve, "permission-dialog");

    let decision =
        RuntimeDecision::from_intent(DecisionSource::User, DecisionIntent::PermissionAllow);
    let decision_event = mapper.map_decision("r2", &decision).expect("decision event");
    store
        .record_feed_events(std::slice::from_ref(&decision_event))
        .expect("record decision");
    feed.push(decision_event);

    assert_eq!(controller.permission_queue().count(), 0);
    assert_eq!(
        controller.rules().match_tool("Write").expect("rule").added_by,
        "permission-dialog"
    );

    let all = kinds(&feed);
    assert_eq!(
        all,
        vec![
            FeedKind::SessionStart,
            FeedKind::RunStart,
            FeedKind::UserPrompt,
            FeedKind::PermissionRequest,
            FeedKind::PermissionDecision,
        ]
    );
    let request_id = &feed[3].event_id;
    assert_eq!(
        feed[4].cause.parent_event_id.as_deref(),
        Some(request_id.as_str())
    );
    assert_feed_invariants(&feed);

    // A follow-up PreToolUse for Write now resolves by rule.
    let follow_up = runtime_event("r9", "PreToolUse", json!({"tool_name": "Write"}));
    let DispatchDirective::Respond(rule_decision) = controller.dispatch(&follow_up) else {
        panic!("expected rule fast-path after always-allow");
    };
    assert_eq!(rule_decision.intent, Some(DecisionIntent::PreToolAllow));
}

/// S3 — over a real socket, an unruled PreToolUse passes through at the
/// deadline and leaves no decision event.
#[tokio::test]
async fn s3_timeout_passthrough_over_socket() {
    struct Recorder {
        controller: Mutex<HookController>,
    }
    impl HookDispatcher for Recorder {
        fn dispatch(&self, event: &RuntimeEvent) -> DispatchDirective {
            match self.controller.lock() {
                Ok(mut controller) => controller.dispatch(event),
                Err(err) => err.into_inner().dispatch(event),
            }
        }
        fn connection_closed(&self, request_ids: &[String]) {
            match self.controller.lock() {
                Ok(mut controller) => controller.prune(request_ids),
                Err(err) => err.into_inner().prune(request_ids),
            }
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = BrokerConfig::new(
        dir.path().to_path_buf(),
        InstanceId::from_string("s3"),
    );
    config.auto_passthrough = Duration::from_millis(100);

    let (notice_tx, mut notice_rx) = unbounded_channel();
    let broker = HookBroker::new(
        config,
        Arc::new(Recorder {
            controller: Mutex::new(HookController::new()),
        }),
        notice_tx,
    );
    broker.start().await.expect("start");

    let socket_path = broker.get_status().socket_path;
    let mut mapper = FeedMapper::new();
    let mut feed = Vec::new();

    for (request_id, hook, payload) in [
        ("rs", "SessionStart", json!({})),
        ("rp", "UserPromptSubmit", json!({"prompt": "x"})),
        (
            "r3",
            "PreToolUse",
            json!({"tool_name": "Glob", "tool_use_id": "t3"}),
        ),
    ] {
        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
        let mut line = json!({
            "v": 1,
            "kind": "hook_event",
            "request_id": request_id,
            "ts": 1,
            "session_id": "adapter-1",
            "hook_event_name": hook,
            "payload": payload,
        })
        .to_string();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.expect("write");

        // Every request gets a result envelope at the deadline.
        let mut raw = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .expect("result timed out")
            .expect("read");
        let text = String::from_utf8(raw).expect("utf8");
        let envelope: HookResultEnvelope =
            serde_json::from_str(text.trim_end()).expect("parse result");
        assert_eq!(envelope.request_id, request_id);
        assert_eq!(envelope.payload, ResultAction::Passthrough);

        // Apply the broker notices to the mapper in order.
        loop {
            let notice = timeout(Duration::from_secs(5), notice_rx.recv())
                .await
                .expect("notice timed out")
                .expect("notice");
            match notice {
                BrokerNotice::Event(event) => feed.extend(mapper.map_event(&event)),
                BrokerNotice::Decision {
                    request_id: decided,
                    decision,
                } => {
                    assert_eq!(decision.source, DecisionSource::Timeout);
                    // No permission.request existed, so no decision event.
                    assert!(mapper.map_decision(&decided, &decision).is_none());
                    break;
                }
            }
        }
    }

    assert_eq!(
        kinds(&feed),
        vec![
            FeedKind::SessionStart,
            FeedKind::RunStart,
            FeedKind::UserPrompt,
            FeedKind::ToolPre,
        ]
    );
    assert_feed_invariants(&feed);

    broker.stop().await;
}

/// S4 — burst ordering: interleaved tools, permissions, and decisions stay
/// strictly ordered and survive a store round trip.
#[test]
fn s4_burst_ordering_with_interleaved_decisions() {
    let mut mapper = FeedMapper::new();
    let mut store = SessionStore::open("athena-s4", StoreBacking::Memory, 0).expect("open");
    let mut feed = Vec::new();

    let mut record = |mapper: &mut FeedMapper,
                      store: &mut SessionStore,
                      feed: &mut Vec<FeedEvent>,
                      event: RuntimeEvent| {
        let derived = mapper.map_event(&event);
        store.record_event(&event, &derived).expect("record");
        feed.extend(derived);
    };

    record(
        &mut mapper,
        &mut store,
        &mut feed,
        runtime_event("rs", "SessionStart", json!({})),
    );
    record(
        &mut mapper,
        &mut store,
        &mut feed,
        runtime_event("rp", "UserPromptSubmit", json!({"prompt": "burst"})),
    );

    for i in 0..30 {
        record(
            &mut mapper,
            &mut store,
            &mut feed,
            runtime_event(
                &format!("pre-{i}"),
                "PreToolUse",
                json!({"tool_name": "Bash", "tool_use_id": format!("t{i}")}),
            ),
        );

        if i % 5 == 0 {
            let request_id = format!("perm-{i}");
            record(
                &mut mapper,
                &mut store,
                &mut feed,
                runtime_event(
                    &request_id,
                    "PermissionRequest",
                    json!({"tool_name": "Write", "tool_use_id": format!("w{i}")}),
                ),
            );
            let decision = RuntimeDecision::from_intent(
                DecisionSource::User,
                DecisionIntent::PermissionAllow,
            );
            let event = mapper
                .map_decision(&request_id, &decision)
                .expect("decision event");
            store
                .record_feed_events(std::slice::from_ref(&event))
                .expect("record decision");
            feed.push(event);
        }

        record(
            &mut mapper,
            &mut store,
            &mut feed,
            runtime_event(
                &format!("post-{i}"),
                "PostToolUse",
                json!({"tool_name": "Bash", "tool_use_id": format!("t{i}")}),
            ),
        );
    }

    assert_feed_invariants(&feed);
    let restored = store.restore();
    assert_eq!(restored.feed_events, feed);

    // Every tool.post correlates to its tool.pre within the run.
    let posts: Vec<&FeedEvent> = feed
        .iter()
        .filter(|event| event.kind() == FeedKind::ToolPost)
        .collect();
    assert_eq!(posts.len(), 30);
    for post in posts {
        let parent = post
            .cause
            .parent_event_id
            .as_deref()
            .expect("tool.post parent");
        let pre = feed
            .iter()
            .find(|event| event.event_id == parent)
            .expect("parent exists");
        assert_eq!(pre.kind(), FeedKind::ToolPre);
        assert_eq!(pre.cause.tool_use_id, post.cause.tool_use_id);
    }
}

/// S5 — resume from a bootstrap continues seq and collides with nothing.
#[test]
fn s5_resume_without_duplication() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.jsonl");

    let initial_count;
    {
        let mut mapper = FeedMapper::new();
        let mut store =
            SessionStore::open("athena-s5", StoreBacking::File(path.clone()), 0).expect("open");
        let mut feed = Vec::new();
        for event in [
            runtime_event("rs", "SessionStart", json!({})),
            runtime_event("rp", "UserPromptSubmit", json!({"prompt": "first"})),
            runtime_event(
                "r1",
                "PreToolUse",
                json!({"tool_name": "Bash", "tool_use_id": "t1"}),
            ),
            runtime_event(
                "r2",
                "PostToolUse",
                json!({"tool_name": "Bash", "tool_use_id": "t1"}),
            ),
            runtime_event("r3", "Stop", json!({"last_assistant_message": "done"})),
        ] {
            let derived = mapper.map_event(&event);
            store.record_event(&event, &derived).expect("record");
            feed.extend(derived);
        }
        initial_count = feed.len();
        store.close();
    }

    let mut store =
        SessionStore::open("athena-s5", StoreBacking::File(path), 0).expect("reopen");
    let bootstrap = store.to_bootstrap().expect("bootstrap");
    let snapshot_max_seq = bootstrap
        .feed_events
        .iter()
        .map(|event| event.seq)
        .max()
        .expect("max seq");

    let mut mapper = FeedMapper::from_bootstrap(&bootstrap);
    let mut fresh = Vec::new();
    for event in [
        runtime_event("r4", "UserPromptSubmit", json!({"prompt": "second"})),
        runtime_event(
            "r5",
            "PreToolUse",
            json!({"tool_name": "Bash", "tool_use_id": "t2"}),
        ),
        runtime_event(
            "r6",
            "PostToolUse",
            json!({"tool_name": "Bash", "tool_use_id": "t2"}),
        ),
    ] {
        let derived = mapper.map_event(&event);
        store.record_event(&event, &derived).expect("record");
        fresh.extend(derived);
    }

    for event in &fresh {
        assert!(event.seq > snapshot_max_seq);
    }

    let restored = store.restore();
    assert_eq!(restored.feed_events.len(), initial_count + fresh.len());
    assert_feed_invariants(&restored.feed_events);
}

/// S6 — the second decision for a request id resolves to nothing.
#[test]
fn s6_double_decision_is_rejected() {
    let mut mapper = FeedMapper::new();
    mapper.map_event(&runtime_event("rs", "SessionStart", json!({})));
    mapper.map_event(&runtime_event("rp", "UserPromptSubmit", json!({"prompt": "x"})));
    mapper.map_event(&runtime_event(
        "r6",
        "PermissionRequest",
        json!({"tool_name": "Write"}),
    ));

    let allow =
        RuntimeDecision::from_intent(DecisionSource::User, DecisionIntent::PermissionAllow);
    let deny = RuntimeDecision::from_intent(
        DecisionSource::User,
        DecisionIntent::PermissionDeny {
            reason: "no".to_string(),
        },
    );

    let first = mapper.map_decision("r6", &allow);
    assert!(first.is_some());
    assert!(mapper.map_decision("r6", &deny).is_none());
}

/// Degraded stickiness survives restore and repeated failures.
#[test]
fn degraded_store_keeps_serving_reads() {
    let mut mapper = FeedMapper::new();
    let mut store = SessionStore::open("athena-deg", StoreBacking::Memory, 0).expect("open");

    let event = runtime_event("rs", "SessionStart", json!({}));
    let derived = mapper.map_event(&event);
    store.record_event(&event, &derived).expect("record");

    store.mark_degraded("write failed: disk full");
    store.mark_degraded("second failure");

    assert!(store.is_degraded());
    assert_eq!(store.degraded_reason(), Some("write failed: disk full"));
    assert_eq!(store.restore().feed_events, derived);
}
