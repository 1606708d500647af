//! The feed facade: mapper + store + controller + queues behind the single
//! surface the UI consumes.
//!
//! The facade owns composition and persistence policy. Store write failures
//! flip the sticky degraded flag instead of interrupting decision delivery;
//! the harness always gets its answer first, the UI is notified after.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use athena_protocol::decision::DecisionIntent;
use athena_protocol::decision::DecisionSource;
use athena_protocol::decision::RuntimeDecision;
use athena_protocol::feed::FeedEvent;
use athena_protocol::feed::FeedKind;
use athena_protocol::feed::FeedLevel;
use athena_protocol::hook::HookEventName;
use athena_protocol::hook::RuntimeEvent;
use athena_protocol::session::Actor;
use athena_protocol::session::Run;
use athena_protocol::session::Session;
use athena_protocol::tokens::TokenUsage;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::BrokerConfig;
use crate::broker::BrokerNotice;
use crate::broker::HookBroker;
use crate::broker::HookDispatcher;
use crate::controller::DispatchDirective;
use crate::controller::HookController;
use crate::controller::OperatorQueue;
use crate::mapper::FeedMapper;
use crate::queues::QueueItemProjection;
use crate::rules::HookRule;
use crate::rules::RuleAction;
use crate::rules::RuleSet;
use crate::store::SessionStore;
use crate::store::StoreBacking;

/// Tag a permission dialog always-allow leaves on the rule it appends.
pub const RULE_ADDED_BY_PERMISSION_DIALOG: &str = "permission-dialog";

/// A UI-originated message merged into the feed's total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    pub seq: u64,
    pub ts_ms: i64,
    pub author: String,
    pub text: String,
}

/// One row of the merged feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Message(ExternalMessage),
    Event(FeedEvent),
}

impl FeedItem {
    pub fn seq(&self) -> u64 {
        match self {
            FeedItem::Message(message) => message.seq,
            FeedItem::Event(event) => event.seq,
        }
    }
}

/// Latest TodoWrite entries, projected for the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// How the operator answered a permission prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionResolution {
    Allow,
    /// Allow and append an approve rule for the tool.
    AlwaysAllow,
    Deny { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<QueueItemProjection>,
    pub count: usize,
}

pub struct FeedFacadeConfig {
    pub broker: BrokerConfig,
    pub session_id: String,
    pub store_backing: StoreBacking,
    pub rules: RuleSet,
}

struct FacadeState {
    mapper: FeedMapper,
    store: SessionStore,
    events: Vec<FeedEvent>,
    messages: Vec<ExternalMessage>,
    tasks: Vec<TaskItem>,
    post_by_tool_use_id: HashMap<String, FeedEvent>,
}

enum FacadeCommand {
    Flush(oneshot::Sender<()>),
}

/// Routes broker dispatch through the shared controller.
struct ControllerDispatcher {
    controller: Arc<Mutex<HookController>>,
}

impl HookDispatcher for ControllerDispatcher {
    fn dispatch(&self, event: &RuntimeEvent) -> DispatchDirective {
        lock_unpoisoned(&self.controller).dispatch(event)
    }

    fn connection_closed(&self, request_ids: &[String]) {
        lock_unpoisoned(&self.controller).prune(request_ids);
    }
}

pub struct FeedFacade {
    state: Arc<Mutex<FacadeState>>,
    controller: Arc<Mutex<HookController>>,
    broker: Arc<HookBroker>,
    cmd_tx: UnboundedSender<FacadeCommand>,
    notify_rx: watch::Receiver<u64>,
    process_task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedFacade {
    /// Open the store, rehydrate the mapper, start the broker, and begin
    /// consuming hook traffic.
    pub async fn start(config: FeedFacadeConfig) -> anyhow::Result<Self> {
        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let store = SessionStore::open(&config.session_id, config.store_backing, created_at_ms)?;

        let (mapper, events) = match store.to_bootstrap() {
            Some(bootstrap) => {
                let mapper = FeedMapper::from_bootstrap(&bootstrap);
                (mapper, bootstrap.feed_events)
            }
            None => (FeedMapper::new(), Vec::new()),
        };

        let controller = Arc::new(Mutex::new(HookController::with_rules(config.rules)));
        let state = Arc::new(Mutex::new(FacadeState {
            mapper,
            store,
            events,
            messages: Vec::new(),
            tasks: Vec::new(),
            post_by_tool_use_id: HashMap::new(),
        }));

        let (notice_tx, notice_rx) = unbounded_channel();
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (notify_tx, notify_rx) = watch::channel(0u64);

        let broker = Arc::new(HookBroker::new(
            config.broker,
            Arc::new(ControllerDispatcher {
                controller: controller.clone(),
            }),
            notice_tx,
        ));
        broker.start().await?;

        let process_task = tokio::spawn(process_loop(
            state.clone(),
            controller.clone(),
            notice_rx,
            cmd_rx,
            notify_tx,
        ));

        Ok(Self {
            state,
            controller,
            broker,
            cmd_tx,
            notify_rx,
            process_task: Mutex::new(Some(process_task)),
        })
    }

    /// Changes signal: the value increments on every feed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify_rx.clone()
    }

    pub fn is_server_running(&self) -> bool {
        self.broker.get_status().running
    }

    pub fn broker(&self) -> &HookBroker {
        &self.broker
    }

    /// Ordered merge of external messages and feed events by `seq`; a
    /// message sharing a seq with an event sorts first. Debug-level events
    /// are excluded from the merged view.
    pub fn items(&self) -> Vec<FeedItem> {
        let state = lock_unpoisoned(&self.state);
        let mut items: Vec<FeedItem> = state
            .messages
            .iter()
            .cloned()
            .map(FeedItem::Message)
            .chain(
                state
                    .events
                    .iter()
                    .filter(|event| event.level != FeedLevel::Debug)
                    .cloned()
                    .map(FeedItem::Event),
            )
            .collect();
        items.sort_by_key(|item| {
            let tie = match item {
                FeedItem::Message(_) => 0u8,
                FeedItem::Event(_) => 1u8,
            };
            (item.seq(), tie)
        });
        items
    }

    pub fn tasks(&self) -> Vec<TaskItem> {
        lock_unpoisoned(&self.state).tasks.clone()
    }

    pub fn session(&self) -> Option<Session> {
        lock_unpoisoned(&self.state).mapper.session().cloned()
    }

    pub fn current_run(&self) -> Option<Run> {
        lock_unpoisoned(&self.state).mapper.current_run().cloned()
    }

    pub fn actors(&self) -> Vec<Actor> {
        lock_unpoisoned(&self.state).mapper.actors().to_vec()
    }

    pub fn permission_queue(&self) -> QueueSnapshot {
        let controller = lock_unpoisoned(&self.controller);
        QueueSnapshot {
            current: controller.permission_queue().current().cloned(),
            count: controller.permission_queue().count(),
        }
    }

    pub fn question_queue(&self) -> QueueSnapshot {
        let controller = lock_unpoisoned(&self.controller);
        QueueSnapshot {
            current: controller.question_queue().current().cloned(),
            count: controller.question_queue().count(),
        }
    }

    pub fn rules(&self) -> Vec<HookRule> {
        lock_unpoisoned(&self.controller).rules().rules()
    }

    pub fn add_rule(
        &self,
        tool_name: impl Into<String>,
        action: RuleAction,
        added_by: impl Into<String>,
    ) -> HookRule {
        lock_unpoisoned(&self.controller)
            .rules_mut()
            .add(tool_name, action, added_by)
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        lock_unpoisoned(&self.controller).rules_mut().remove(rule_id)
    }

    /// Answer the head (or any) pending permission request.
    ///
    /// `AlwaysAllow` additionally appends an approve rule tagged
    /// `permission-dialog`, so the next request for the same tool resolves
    /// without the operator.
    pub async fn resolve_permission(
        &self,
        request_id: &str,
        resolution: PermissionResolution,
    ) -> bool {
        let projection =
            lock_unpoisoned(&self.controller).dequeue(OperatorQueue::Permission, request_id);

        let intent = match &resolution {
            PermissionResolution::Allow => DecisionIntent::PermissionAllow,
            PermissionResolution::AlwaysAllow => {
                if let Some(projection) = &projection
                    && !projection.tool_name.is_empty()
                {
                    lock_unpoisoned(&self.controller).rules_mut().add(
                        projection.tool_name.clone(),
                        RuleAction::Approve,
                        RULE_ADDED_BY_PERMISSION_DIALOG,
                    );
                }
                DecisionIntent::PermissionAllow
            }
            PermissionResolution::Deny { reason } => DecisionIntent::PermissionDeny {
                reason: reason.clone(),
            },
        };

        self.broker
            .send_decision(
                request_id,
                RuntimeDecision::from_intent(DecisionSource::User, intent),
            )
            .await
    }

    /// Answer a queued agent question.
    pub async fn resolve_question(
        &self,
        request_id: &str,
        answers: BTreeMap<String, String>,
    ) -> bool {
        lock_unpoisoned(&self.controller).dequeue(OperatorQueue::Question, request_id);
        self.broker
            .send_decision(
                request_id,
                RuntimeDecision::from_intent(
                    DecisionSource::User,
                    DecisionIntent::QuestionAnswer { answers },
                ),
            )
            .await
    }

    /// Clear the visible feed. The durable store is untouched.
    pub fn clear_events(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.events.clear();
        state.messages.clear();
        state.post_by_tool_use_id.clear();
    }

    /// Synthesize a Notification feed event carrying the current task list.
    /// No-op when no TodoWrite activity was observed.
    pub fn print_task_snapshot(&self) -> Option<FeedEvent> {
        let mut state = lock_unpoisoned(&self.state);
        if state.tasks.is_empty() {
            return None;
        }

        let mut lines = vec![format!("Tasks ({}):", state.tasks.len())];
        for task in &state.tasks {
            lines.push(format!("[{}] {}", task.status, task.content));
        }
        let message = lines.join("\n");
        let ts_ms = chrono::Utc::now().timestamp_millis();
        let event = state.mapper.synthesize_notification(ts_ms, message);
        if let Err(err) = state.store.record_feed_events(std::slice::from_ref(&event)) {
            state.store.mark_degraded(format!("{err:#}"));
        }
        state.events.push(event.clone());
        Some(event)
    }

    pub fn is_degraded(&self) -> bool {
        lock_unpoisoned(&self.state).store.is_degraded()
    }

    pub fn degraded_reason(&self) -> Option<String> {
        lock_unpoisoned(&self.state)
            .store
            .degraded_reason()
            .map(ToOwned::to_owned)
    }

    /// The tool.post / tool.failure event recorded for a tool_use_id.
    pub fn post_by_tool_use_id(&self, tool_use_id: &str) -> Option<FeedEvent> {
        lock_unpoisoned(&self.state)
            .post_by_tool_use_id
            .get(tool_use_id)
            .cloned()
    }

    /// Seq allocator for UI-synthesized items, so external messages share
    /// the feed's total order.
    pub fn allocate_seq(&self) -> u64 {
        lock_unpoisoned(&self.state).mapper.allocate_seq()
    }

    /// Add an external message to the merged feed.
    pub fn push_message(&self, author: impl Into<String>, text: impl Into<String>) -> u64 {
        let mut state = lock_unpoisoned(&self.state);
        let seq = state.mapper.allocate_seq();
        state.messages.push(ExternalMessage {
            seq,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            author: author.into(),
            text: text.into(),
        });
        seq
    }

    /// Persist the token snapshot for one harness process.
    pub fn record_tokens(&self, adapter_session_id: &str, tokens: TokenUsage) {
        let mut state = lock_unpoisoned(&self.state);
        if let Err(err) = state.store.record_tokens(adapter_session_id, tokens) {
            state.store.mark_degraded(format!("{err:#}"));
        }
    }

    pub fn restored_tokens(&self) -> Option<TokenUsage> {
        lock_unpoisoned(&self.state).store.restored_tokens()
    }

    /// Session-index info: adapter session ids seen and total recorded feed
    /// events.
    pub fn session_summary(&self) -> (Vec<String>, u64) {
        let state = lock_unpoisoned(&self.state);
        let restored = state.store.restore();
        (
            restored.adapter_session_ids,
            restored.feed_events.len() as u64,
        )
    }

    /// Wait until every notice received so far has been applied to the feed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(FacadeCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop the broker (resolving pendings), apply the remaining notices,
    /// and close the store.
    pub async fn shutdown(&self) {
        self.broker.stop().await;
        self.flush().await;
        {
            let mut state = lock_unpoisoned(&self.state);
            state.store.close();
        }
        if let Some(task) = lock_unpoisoned(&self.process_task).take() {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn process_loop(
    state: Arc<Mutex<FacadeState>>,
    controller: Arc<Mutex<HookController>>,
    mut notice_rx: UnboundedReceiver<BrokerNotice>,
    mut cmd_rx: UnboundedReceiver<FacadeCommand>,
    notify_tx: watch::Sender<u64>,
) {
    loop {
        tokio::select! {
            maybe_notice = notice_rx.recv() => {
                let Some(notice) = maybe_notice else { break };
                handle_notice(&state, &controller, notice);
                bump(&notify_tx);
            }
            maybe_cmd = cmd_rx.recv() => {
                let Some(FacadeCommand::Flush(ack)) = maybe_cmd else { break };
                // Drain everything already enqueued before acknowledging.
                while let Ok(notice) = notice_rx.try_recv() {
                    handle_notice(&state, &controller, notice);
                }
                bump(&notify_tx);
                let _ = ack.send(());
            }
        }
    }
}

fn bump(notify_tx: &watch::Sender<u64>) {
    notify_tx.send_modify(|version| *version += 1);
}

fn handle_notice(
    state: &Arc<Mutex<FacadeState>>,
    controller: &Arc<Mutex<HookController>>,
    notice: BrokerNotice,
) {
    match notice {
        BrokerNotice::Event(event) => {
            let mut state = lock_unpoisoned(state);
            let derived = state.mapper.map_event(&event);
            if let Err(err) = state.store.record_event(&event, &derived) {
                state.store.mark_degraded(format!("{err:#}"));
            }

            if let Some(tasks) = extract_todo_tasks(&event) {
                state.tasks = tasks;
            }
            for feed_event in &derived {
                if matches!(
                    feed_event.kind(),
                    FeedKind::ToolPost | FeedKind::ToolFailure
                ) && let Some(tool_use_id) = &feed_event.cause.tool_use_id
                {
                    state
                        .post_by_tool_use_id
                        .insert(tool_use_id.clone(), feed_event.clone());
                }
            }
            state.events.extend(derived);
        }
        BrokerNotice::Decision {
            request_id,
            decision,
        } => {
            // Covers every resolution path (operator, timer, socket close):
            // a decided request can no longer sit in an operator queue.
            lock_unpoisoned(controller).prune(std::slice::from_ref(&request_id));

            let mut state = lock_unpoisoned(state);
            if let Some(event) = state.mapper.map_decision(&request_id, &decision) {
                if let Err(err) = state.store.record_feed_events(std::slice::from_ref(&event)) {
                    state.store.mark_degraded(format!("{err:#}"));
                }
                state.events.push(event);
            }
        }
    }
}

/// TodoWrite task list from a tool event, when present.
fn extract_todo_tasks(event: &RuntimeEvent) -> Option<Vec<TaskItem>> {
    if event.hook != HookEventName::PreToolUse && event.hook != HookEventName::PostToolUse {
        return None;
    }
    if event.tool_name.as_deref() != Some("TodoWrite") {
        return None;
    }
    let todos = event.payload.get("tool_input")?.get("todos")?.as_array()?;

    let mut tasks = Vec::with_capacity(todos.len());
    for todo in todos {
        let content = todo
            .get("content")
            .or_else(|| todo.get("subject"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            continue;
        }
        tasks.push(TaskItem {
            content,
            status: todo
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_string(),
            active_form: todo
                .get("activeForm")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        });
    }
    Some(tasks)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athena_protocol::InstanceId;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::time::Duration;
    use tokio::time::timeout;

    async fn start_facade(rules: RuleSet) -> (FeedFacade, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let facade = FeedFacade::start(FeedFacadeConfig {
            broker: BrokerConfig::new(
                dir.path().to_path_buf(),
                InstanceId::from_string("facade-test"),
            ),
            session_id: "athena-1".to_string(),
            store_backing: StoreBacking::Memory,
            rules,
        })
        .await
        .expect("start facade");
        (facade, dir)
    }

    async fn connect(facade: &FeedFacade) -> UnixStream {
        UnixStream::connect(facade.broker().get_status().socket_path)
            .await
            .expect("connect")
    }

    fn envelope_line(request_id: &str, hook: &str, payload: Value) -> String {
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
        line
    }

    async fn send_event(stream: &mut UnixStream, line: &str) {
        stream.write_all(line.as_bytes()).await.expect("write");
    }

    async fn read_result(stream: &mut UnixStream) -> Value {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
                .await
                .expect("read timed out")
                .expect("read");
            assert!(n > 0, "socket closed before result");
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
        }
        serde_json::from_slice(&buffer).expect("parse result")
    }

    fn event_kinds(facade: &FeedFacade) -> Vec<FeedKind> {
        facade
            .items()
            .into_iter()
            .filter_map(|item| match item {
                FeedItem::Event(event) => Some(event.kind()),
                FeedItem::Message(_) => None,
            })
            .collect()
    }

    /// Socket writes land asynchronously; poll for the resulting feed state
    /// instead of assuming the broker already consumed the line.
    async fn wait_until<F>(what: &str, condition: F)
    where
        F: Fn() -> bool,
    {
        let waited = timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn rule_based_deny_responds_and_records_tool_pre() {
        let mut rules = RuleSet::new();
        rules.add("Bash", RuleAction::Deny, "test");
        let (facade, _dir) = start_facade(rules).await;

        let mut stream = connect(&facade).await;
        send_event(
            &mut stream,
            &envelope_line("r0", "SessionStart", json!({"source": "startup"})),
        )
        .await;
        send_event(
            &mut stream,
            &envelope_line("rp", "UserPromptSubmit", json!({"prompt": "x"})),
        )
        .await;

        let mut stream2 = connect(&facade).await;
        send_event(
            &mut stream2,
            &envelope_line(
                "r1",
                "PreToolUse",
                json!({"tool_name": "Bash", "tool_use_id": "t1", "tool_input": {"command": "rm"}}),
            ),
        )
        .await;

        let result = read_result(&mut stream2).await;
        assert_eq!(result["request_id"], "r1");
        assert_eq!(
            result["payload"]["stdout_json"]["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
        assert_eq!(
            result["payload"]["stdout_json"]["hookSpecificOutput"]["permissionDecisionReason"],
            "Blocked by rule: test"
        );

        wait_until("tool.pre to land", || event_kinds(&facade).len() >= 4).await;
        // Rule denial of a PreToolUse leaves no decision event in the feed.
        assert_eq!(
            event_kinds(&facade),
            vec![
                FeedKind::SessionStart,
                FeedKind::RunStart,
                FeedKind::UserPrompt,
                FeedKind::ToolPre,
            ]
        );

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn operator_always_allow_appends_rule_and_records_decision() {
        let (facade, _dir) = start_facade(RuleSet::new()).await;

        let mut stream = connect(&facade).await;
        send_event(&mut stream, &envelope_line("r0", "SessionStart", json!({}))).await;
        send_event(
            &mut stream,
            &envelope_line("rp", "UserPromptSubmit", json!({"prompt": "x"})),
        )
        .await;

        let mut stream2 = connect(&facade).await;
        send_event(
            &mut stream2,
            &envelope_line(
                "r2",
                "PermissionRequest",
                json!({"tool_name": "Write", "tool_use_id": "t2", "tool_input": {"path": "a"}}),
            ),
        )
        .await;

        wait_until("permission request to queue", || {
            facade.permission_queue().count == 1
        })
        .await;
        assert_eq!(
            facade
                .permission_queue()
                .current
                .expect("head")
                .request_id,
            "r2"
        );

        let resolved = facade
            .resolve_permission("r2", PermissionResolution::AlwaysAllow)
            .await;
        assert!(resolved);

        let result = read_result(&mut stream2).await;
        assert_eq!(result["request_id"], "r2");
        assert_eq!(
            result["payload"]["stdout_json"]["hookSpecificOutput"]["decision"]["behavior"],
            "allow"
        );

        wait_until("decision to land", || event_kinds(&facade).len() >= 5).await;
        assert_eq!(facade.permission_queue().count, 0);

        let rules = facade.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].tool_name, "Write");
        assert_eq!(rules[0].action, RuleAction::Approve);
        assert_eq!(rules[0].added_by, RULE_ADDED_BY_PERMISSION_DIALOG);

        let kinds = event_kinds(&facade);
        assert_eq!(
            kinds,
            vec![
                FeedKind::SessionStart,
                FeedKind::RunStart,
                FeedKind::UserPrompt,
                FeedKind::PermissionRequest,
                FeedKind::PermissionDecision,
            ]
        );

        // The decision points back at its request.
        let items = facade.items();
        let FeedItem::Event(request) = &items[3] else {
            panic!("expected event");
        };
        let FeedItem::Event(decision) = &items[4] else {
            panic!("expected event");
        };
        assert_eq!(
            decision.cause.parent_event_id.as_deref(),
            Some(request.event_id.as_str())
        );

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn todo_write_updates_tasks_and_snapshot_emits_notification() {
        let (facade, _dir) = start_facade(RuleSet::new()).await;

        assert!(facade.print_task_snapshot().is_none());

        let mut stream = connect(&facade).await;
        send_event(&mut stream, &envelope_line("r0", "SessionStart", json!({}))).await;
        send_event(
            &mut stream,
            &envelope_line(
                "r1",
                "PreToolUse",
                json!({
                    "tool_name": "TodoWrite",
                    "tool_input": {"todos": [
                        {"content": "write tests", "status": "in_progress", "activeForm": "Writing tests"},
                        {"content": "ship", "status": "pending"},
                    ]},
                }),
            ),
        )
        .await;

        wait_until("tasks to update", || facade.tasks().len() == 2).await;
        let tasks = facade.tasks();
        assert_eq!(tasks[0].content, "write tests");
        assert_eq!(tasks[0].status, "in_progress");

        let snapshot = facade.print_task_snapshot().expect("snapshot");
        assert_eq!(snapshot.kind(), FeedKind::Notification);
        assert!(event_kinds(&facade).contains(&FeedKind::Notification));

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn messages_merge_before_events_on_equal_seq() {
        let (facade, _dir) = start_facade(RuleSet::new()).await;

        let mut stream = connect(&facade).await;
        send_event(&mut stream, &envelope_line("r0", "SessionStart", json!({}))).await;
        wait_until("session.start to land", || !facade.items().is_empty()).await;

        facade.push_message("operator", "note to self");
        let items = facade.items();
        let positions: Vec<u64> = items.iter().map(FeedItem::seq).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "items must be seq-ordered");
        assert!(matches!(items.last(), Some(FeedItem::Message(_))));

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn post_index_tracks_tool_results() {
        let (facade, _dir) = start_facade(RuleSet::new()).await;

        let mut stream = connect(&facade).await;
        send_event(&mut stream, &envelope_line("r0", "SessionStart", json!({}))).await;
        send_event(
            &mut stream,
            &envelope_line(
                "r1",
                "PreToolUse",
                json!({"tool_name": "Bash", "tool_use_id": "t9"}),
            ),
        )
        .await;
        send_event(
            &mut stream,
            &envelope_line(
                "r2",
                "PostToolUse",
                json!({"tool_name": "Bash", "tool_use_id": "t9", "tool_response": {"ok": true}}),
            ),
        )
        .await;

        wait_until("post to index", || {
            facade.post_by_tool_use_id("t9").is_some()
        })
        .await;
        let post = facade.post_by_tool_use_id("t9").expect("post event");
        assert_eq!(post.kind(), FeedKind::ToolPost);
        assert!(facade.post_by_tool_use_id("t-missing").is_none());

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn clear_events_keeps_store_and_session_state() {
        let (facade, _dir) = start_facade(RuleSet::new()).await;

        let mut stream = connect(&facade).await;
        send_event(&mut stream, &envelope_line("r0", "SessionStart", json!({}))).await;
        wait_until("session.start to land", || !facade.items().is_empty()).await;

        facade.clear_events();
        assert!(facade.items().is_empty());
        assert!(facade.session().is_some(), "mapper state survives clear");

        facade.shutdown().await;
    }
}
