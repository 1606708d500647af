//! The hook broker: a Unix-domain-socket server the harness-side forwarder
//! dials for every hook event.
//!
//! Each connection carries NDJSON event envelopes; the broker answers each
//! request with exactly one result envelope, sourced from a rule, the
//! operator, or the auto-passthrough deadline. The deadline must stay below
//! the forwarder's own timeout so our decision always arrives first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use athena_protocol::InstanceId;
use athena_protocol::decision::DecisionSource;
use athena_protocol::decision::RuntimeDecision;
use athena_protocol::envelope::HookResultEnvelope;
use athena_protocol::envelope::decode_event_line;
use athena_protocol::envelope::encode_result_line;
use athena_protocol::hook::RuntimeEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::controller::DispatchDirective;
use crate::hook_log::HookLog;

/// Decision sources the broker consults, in order, for one event.
pub trait HookDispatcher: Send + Sync {
    fn dispatch(&self, event: &RuntimeEvent) -> DispatchDirective;

    /// Called after a socket close orphans queued requests, so the operator
    /// queues can prune them.
    fn connection_closed(&self, request_ids: &[String]);
}

/// Everything the broker tells its consumer, in arrival order.
///
/// A single channel keeps event and decision ordering: the feed must record
/// a request before its decision.
#[derive(Debug, Clone)]
pub enum BrokerNotice {
    Event(RuntimeEvent),
    Decision {
        request_id: String,
        decision: RuntimeDecision,
    },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub project_dir: PathBuf,
    pub instance_id: InstanceId,
    /// Deadline for requests no rule or operator resolves. Must stay
    /// strictly below the harness forwarder timeout (250 ms in the oldest
    /// known forwarder).
    pub auto_passthrough: Duration,
}

impl BrokerConfig {
    pub const DEFAULT_AUTO_PASSTHROUGH: Duration = Duration::from_millis(200);

    pub fn new(project_dir: PathBuf, instance_id: InstanceId) -> Self {
        Self {
            project_dir,
            instance_id,
            auto_passthrough: Self::DEFAULT_AUTO_PASSTHROUGH,
        }
    }

    /// `{projectDir}/.claude/run/ink-{instanceId}.sock`
    pub fn socket_path(&self) -> PathBuf {
        self.project_dir
            .join(".claude")
            .join("run")
            .join(format!("ink-{}.sock", self.instance_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub running: bool,
    pub socket_path: PathBuf,
    pub pending_count: usize,
}

struct PendingRequest {
    conn_id: u64,
    hook_name: String,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    timer: Option<JoinHandle<()>>,
}

struct BrokerInner {
    config: BrokerConfig,
    dispatcher: Arc<dyn HookDispatcher>,
    notice_tx: UnboundedSender<BrokerNotice>,
    hook_log: HookLog,
    pending: Mutex<HashMap<String, PendingRequest>>,
    running: AtomicBool,
    next_conn_id: AtomicU64,
}

/// UDS listener plus the pending-request table.
pub struct HookBroker {
    inner: Arc<BrokerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl HookBroker {
    pub fn new(
        config: BrokerConfig,
        dispatcher: Arc<dyn HookDispatcher>,
        notice_tx: UnboundedSender<BrokerNotice>,
    ) -> Self {
        let hook_log = HookLog::new(&config.project_dir);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                dispatcher,
                notice_tx,
                hook_log,
                pending: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the socket and start accepting connections.
    ///
    /// A stale socket file is unlinked; a live one (another instance still
    /// answering) is a fail-fast error.
    pub async fn start(&self) -> anyhow::Result<()> {
        let socket_path = self.inner.config.socket_path();
        let run_dir = socket_path
            .parent()
            .context("socket path has no parent")?
            .to_path_buf();
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("create {}", run_dir.display()))?;

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).await.is_ok() {
                anyhow::bail!(
                    "socket {} is already in use by another instance",
                    socket_path.display()
                );
            }
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("unlink stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("bind {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, permissions)
                .with_context(|| format!("chmod {}", socket_path.display()))?;
        }

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        let inner = inner.clone();
                        tokio::spawn(run_connection(inner, stream, conn_id));
                    }
                    Err(err) => {
                        tracing::warn!("hook socket accept failed: {err}");
                        break;
                    }
                }
            }
        });

        let mut guard = lock_unpoisoned(&self.accept_task);
        *guard = Some(task);
        Ok(())
    }

    /// Resolve one pending request. Idempotent: a second call for the same
    /// request id is a no-op because the pending entry is already gone.
    pub async fn send_decision(&self, request_id: &str, decision: RuntimeDecision) -> bool {
        respond(&self.inner, request_id, decision).await
    }

    pub fn get_status(&self) -> BrokerStatus {
        BrokerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            socket_path: self.inner.config.socket_path(),
            pending_count: lock_unpoisoned(&self.inner.pending).len(),
        }
    }

    /// Stop accepting, resolve remaining pendings with passthrough, and
    /// remove the socket file.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = lock_unpoisoned(&self.accept_task).take() {
            task.abort();
        }

        let remaining: Vec<String> = lock_unpoisoned(&self.inner.pending)
            .keys()
            .cloned()
            .collect();
        for request_id in remaining {
            respond(
                &self.inner,
                &request_id,
                RuntimeDecision::passthrough(DecisionSource::Auto),
            )
            .await;
        }

        let socket_path = self.inner.config.socket_path();
        if socket_path.exists()
            && let Err(err) = std::fs::remove_file(&socket_path)
        {
            tracing::warn!("remove {} failed: {err}", socket_path.display());
        }
    }
}

async fn run_connection(inner: Arc<BrokerInner>, stream: UnixStream, conn_id: u64) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(Some(write_half)));
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(conn_id, "hook connection read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match decode_event_line(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Protocol errors close the connection; no request id was
                // established, so there is nothing to decide.
                tracing::debug!(conn_id, "invalid hook envelope, closing: {err}");
                break;
            }
        };

        let event = RuntimeEvent::from_envelope(&envelope);
        let request_id = event.id.clone();
        inner.hook_log.received(&event);

        {
            let mut pending = lock_unpoisoned(&inner.pending);
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    conn_id,
                    hook_name: event.hook.as_str().to_string(),
                    writer: writer.clone(),
                    timer: None,
                },
            );
        }

        let directive = inner.dispatcher.dispatch(&event);
        let _ = inner.notice_tx.send(BrokerNotice::Event(event));

        match directive {
            DispatchDirective::Respond(decision) => {
                respond(&inner, &request_id, decision).await;
            }
            DispatchDirective::AwaitOperator(_) => {
                // Operator-queued requests have no broker-side deadline; the
                // forwarder enforces its own upper bound.
            }
            DispatchDirective::ArmTimeout => {
                let timer_inner = inner.clone();
                let timer_request_id = request_id.clone();
                let deadline = inner.config.auto_passthrough;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    respond(
                        &timer_inner,
                        &timer_request_id,
                        RuntimeDecision::passthrough(DecisionSource::Timeout),
                    )
                    .await;
                });

                let mut pending = lock_unpoisoned(&inner.pending);
                if let Some(entry) = pending.get_mut(&request_id) {
                    entry.timer = Some(timer);
                } else {
                    // Already resolved before the map was re-locked.
                    timer.abort();
                }
            }
        }
    }

    // Connection gone: any request still pending on it gets a synthetic
    // passthrough so the feed records the closure, and queued prompts are
    // pruned from the operator dialog.
    let orphaned: Vec<String> = {
        let mut pending = lock_unpoisoned(&inner.pending);
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id)
                && let Some(timer) = entry.timer
            {
                timer.abort();
            }
        }
        ids
    };

    if !orphaned.is_empty() {
        inner.dispatcher.connection_closed(&orphaned);
        for request_id in orphaned {
            let _ = inner.notice_tx.send(BrokerNotice::Decision {
                request_id,
                decision: RuntimeDecision::passthrough(DecisionSource::Auto),
            });
        }
    }
}

/// Write the result envelope, half-close the connection, and notify the
/// decision channel. Decision listeners are notified outside the pending
/// map lock, and only after the write back to the harness completed.
async fn respond(inner: &Arc<BrokerInner>, request_id: &str, decision: RuntimeDecision) -> bool {
    let entry = {
        let mut pending = lock_unpoisoned(&inner.pending);
        pending.remove(request_id)
    };
    let Some(entry) = entry else {
        return false;
    };
    if let Some(timer) = entry.timer {
        timer.abort();
    }

    let ts = chrono::Utc::now().timestamp_millis();
    let action = decision.to_result_action();
    let envelope = HookResultEnvelope::new(request_id, ts, action.clone());

    match encode_result_line(&envelope) {
        Ok(line) => {
            let mut writer = entry.writer.lock().await;
            if let Some(write_half) = writer.as_mut() {
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    tracing::warn!(request_id, "hook result write failed: {err}");
                } else if let Err(err) = write_half.shutdown().await {
                    tracing::debug!(request_id, "hook socket half-close failed: {err}");
                }
                // Half-closed: no further results travel on this connection.
                writer.take();
            }
        }
        Err(err) => {
            tracing::warn!(request_id, "hook result encode failed: {err}");
        }
    }

    inner
        .hook_log
        .responded(request_id, &entry.hook_name, ts, &action);
    let _ = inner.notice_tx.send(BrokerNotice::Decision {
        request_id: request_id.to_string(),
        decision,
    });
    true
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
    use athena_protocol::decision::DecisionIntent;
    use athena_protocol::envelope::ResultAction;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt as _;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::Duration;
    use tokio::time::timeout;

    struct ScriptedDispatcher {
        directive: Mutex<DispatchDirective>,
        closed: Mutex<Vec<String>>,
    }

    impl ScriptedDispatcher {
        fn new(directive: DispatchDirective) -> Arc<Self> {
            Arc::new(Self {
                directive: Mutex::new(directive),
                closed: Mutex::new(Vec::new()),
            })
        }
    }

    impl HookDispatcher for ScriptedDispatcher {
        fn dispatch(&self, _event: &RuntimeEvent) -> DispatchDirective {
            lock_unpoisoned(&self.directive).clone()
        }

        fn connection_closed(&self, request_ids: &[String]) {
            lock_unpoisoned(&self.closed).extend(request_ids.iter().cloned());
        }
    }

    fn event_line(request_id: &str) -> String {
        let mut line = json!({
            "v": 1,
            "kind": "hook_event",
            "request_id": request_id,
            "ts": 1,
            "session_id": "s1",
            "hook_event_name": "PreToolUse",
            "payload": {"tool_name": "Bash", "tool_use_id": "t1"},
        })
        .to_string();
        line.push('\n');
        line
    }

    async fn start_broker(
        dispatcher: Arc<dyn HookDispatcher>,
        auto_passthrough: Duration,
    ) -> (HookBroker, UnboundedReceiver<BrokerNotice>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = BrokerConfig::new(
            dir.path().to_path_buf(),
            InstanceId::from_string("test"),
        );
        config.auto_passthrough = auto_passthrough;
        let (notice_tx, notice_rx) = unbounded_channel();
        let broker = HookBroker::new(config, dispatcher, notice_tx);
        broker.start().await.expect("start broker");
        (broker, notice_rx, dir)
    }

    async fn read_result_line(stream: &mut UnixStream) -> HookResultEnvelope {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
                .await
                .expect("read timed out")
                .expect("read");
            assert!(n > 0, "socket closed before result line");
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
        }
        serde_json::from_slice(&buffer).expect("parse result envelope")
    }

    #[tokio::test]
    async fn rule_directive_responds_synchronously() {
        let decision = RuntimeDecision::from_intent(
            DecisionSource::Rule,
            DecisionIntent::PreToolDeny {
                reason: "Blocked by rule: test".to_string(),
            },
        );
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::Respond(decision));
        let (broker, mut notices, _dir) =
            start_broker(dispatcher, Duration::from_secs(60)).await;

        let mut stream = UnixStream::connect(broker.get_status().socket_path)
            .await
            .expect("connect");
        stream
            .write_all(event_line("r1").as_bytes())
            .await
            .expect("write");

        let result = read_result_line(&mut stream).await;
        assert_eq!(result.request_id, "r1");
        let ResultAction::JsonOutput { stdout_json } = result.payload else {
            panic!("expected json_output, got {:?}", result.payload);
        };
        assert_eq!(
            stdout_json["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );

        // Event notice precedes the decision notice.
        let first = notices.recv().await.expect("event notice");
        assert!(matches!(first, BrokerNotice::Event(_)));
        let second = notices.recv().await.expect("decision notice");
        let BrokerNotice::Decision { request_id, .. } = second else {
            panic!("expected decision notice");
        };
        assert_eq!(request_id, "r1");

        broker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_emits_passthrough_with_matching_request_id() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::ArmTimeout);
        let (broker, mut notices, _dir) =
            start_broker(dispatcher, Duration::from_millis(200)).await;

        let mut stream = UnixStream::connect(broker.get_status().socket_path)
            .await
            .expect("connect");
        stream
            .write_all(event_line("r3").as_bytes())
            .await
            .expect("write");

        let result = read_result_line(&mut stream).await;
        assert_eq!(result.request_id, "r3");
        assert_eq!(result.payload, ResultAction::Passthrough);

        let _event = notices.recv().await.expect("event notice");
        let decision = notices.recv().await.expect("decision notice");
        let BrokerNotice::Decision { decision, .. } = decision else {
            panic!("expected decision notice");
        };
        assert_eq!(decision.source, DecisionSource::Timeout);

        broker.stop().await;
    }

    #[tokio::test]
    async fn operator_resolution_answers_queued_request() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::AwaitOperator(
            crate::controller::OperatorQueue::Permission,
        ));
        let (broker, mut notices, _dir) =
            start_broker(dispatcher, Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(broker.get_status().socket_path)
            .await
            .expect("connect");
        stream
            .write_all(event_line("r2").as_bytes())
            .await
            .expect("write");

        let _event = notices.recv().await.expect("event notice");
        assert_eq!(broker.get_status().pending_count, 1);

        // No timer is armed for operator-queued requests; resolve manually.
        let resolved = broker
            .send_decision(
                "r2",
                RuntimeDecision::from_intent(
                    DecisionSource::User,
                    DecisionIntent::PermissionAllow,
                ),
            )
            .await;
        assert!(resolved);

        let result = read_result_line(&mut stream).await;
        assert_eq!(result.request_id, "r2");

        // Second decision is a no-op.
        let resolved_again = broker
            .send_decision("r2", RuntimeDecision::passthrough(DecisionSource::User))
            .await;
        assert!(!resolved_again);

        broker.stop().await;
    }

    #[tokio::test]
    async fn malformed_line_closes_connection_without_decision() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::ArmTimeout);
        let (broker, mut notices, _dir) =
            start_broker(dispatcher.clone(), Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(broker.get_status().socket_path)
            .await
            .expect("connect");
        stream.write_all(b"{not json}\n").await.expect("write");

        // Server closes: read returns EOF.
        let mut buffer = Vec::new();
        let n = timeout(Duration::from_secs(5), stream.read_to_end(&mut buffer))
            .await
            .expect("read timed out")
            .expect("read");
        assert_eq!(n, 0, "expected EOF with no payload");
        assert!(notices.try_recv().is_err(), "no notice for invalid line");

        broker.stop().await;
    }

    #[tokio::test]
    async fn connection_close_prunes_pending_and_notifies_dispatcher() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::AwaitOperator(
            crate::controller::OperatorQueue::Permission,
        ));
        let (broker, mut notices, _dir) =
            start_broker(dispatcher.clone(), Duration::from_secs(60)).await;

        let mut stream = UnixStream::connect(broker.get_status().socket_path)
            .await
            .expect("connect");
        stream
            .write_all(event_line("r4").as_bytes())
            .await
            .expect("write");
        let _event = notices.recv().await.expect("event notice");
        assert_eq!(broker.get_status().pending_count, 1);

        drop(stream);

        let decision = timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("notice timed out")
            .expect("decision notice");
        let BrokerNotice::Decision {
            request_id,
            decision,
        } = decision
        else {
            panic!("expected synthetic decision");
        };
        assert_eq!(request_id, "r4");
        assert_eq!(decision.source, DecisionSource::Auto);

        assert_eq!(broker.get_status().pending_count, 0);
        assert_eq!(
            *lock_unpoisoned(&dispatcher.closed),
            vec!["r4".to_string()]
        );

        broker.stop().await;
    }

    #[tokio::test]
    async fn stop_resolves_remaining_pendings_and_removes_socket() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::AwaitOperator(
            crate::controller::OperatorQueue::Permission,
        ));
        let (broker, mut notices, _dir) =
            start_broker(dispatcher, Duration::from_secs(60)).await;
        let socket_path = broker.get_status().socket_path;

        let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
        stream
            .write_all(event_line("r5").as_bytes())
            .await
            .expect("write");
        let _event = notices.recv().await.expect("event notice");

        broker.stop().await;

        let result = read_result_line(&mut stream).await;
        assert_eq!(result.request_id, "r5");
        assert_eq!(result.payload, ResultAction::Passthrough);
        assert!(!socket_path.exists(), "socket file should be removed");
        assert!(!broker.get_status().running);
    }

    #[tokio::test]
    async fn second_instance_on_live_socket_fails_fast() {
        let dispatcher = ScriptedDispatcher::new(DispatchDirective::ArmTimeout);
        let (broker, _notices, dir) =
            start_broker(dispatcher.clone(), Duration::from_secs(60)).await;

        let config = BrokerConfig::new(
            dir.path().to_path_buf(),
            InstanceId::from_string("test"),
        );
        let (notice_tx, _notice_rx) = unbounded_channel();
        let second = HookBroker::new(config, dispatcher, notice_tx);
        let err = second.start().await.expect_err("expected bind collision");
        assert!(err.to_string().contains("already in use"));

        broker.stop().await;
    }
}
