//! Harness child-process supervision.
//!
//! Spawns the harness with `ATHENA_INSTANCE_ID` exported so its hook
//! forwarder can dial our socket, pumps stdout stream-json into the token
//! accumulator, renders the feed as it grows, and tears everything down in
//! an order that guarantees the harness hears every decision before the UI
//! side goes away.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use athena_feed::broker::BrokerConfig;
use athena_feed::facade::FeedFacade;
use athena_feed::facade::FeedFacadeConfig;
use athena_feed::facade::RULE_ADDED_BY_PERMISSION_DIALOG;
use athena_feed::rules::RuleSet;
use athena_feed::store::StoreBacking;
use athena_feed::token_accumulator::TokenAccumulator;
use athena_protocol::InstanceId;
use athena_protocol::tokens::TokenUsage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;

use crate::config::ConfigStore;
use crate::config::StoredRule;
use crate::printer::FeedPrinter;
use crate::sessions::SessionMeta;
use crate::sessions::SessionPaths;
use crate::sessions::read_meta;
use crate::sessions::write_meta;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_dir: PathBuf,
    pub harness_bin: String,
    pub harness_args: Vec<String>,
    pub instance_id: InstanceId,
    pub auto_passthrough: Duration,
    pub session: SessionPaths,
    pub label: Option<String>,
    pub rules: RuleSet,
}

pub async fn run_supervisor(config: SupervisorConfig) -> anyhow::Result<i32> {
    let SupervisorConfig {
        project_dir,
        harness_bin,
        harness_args,
        instance_id,
        auto_passthrough,
        session,
        label,
        rules,
    } = config;

    let mut broker_config = BrokerConfig::new(project_dir.clone(), instance_id.clone());
    broker_config.auto_passthrough = auto_passthrough;

    let facade = FeedFacade::start(FeedFacadeConfig {
        broker: broker_config,
        session_id: session.session_id.clone(),
        store_backing: StoreBacking::File(session.store_path.clone()),
        rules,
    })
    .await
    .context("start feed facade")?;

    let mut child = Command::new(&harness_bin)
        .args(&harness_args)
        .env("ATHENA_INSTANCE_ID", instance_id.as_str())
        .current_dir(&project_dir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start harness `{harness_bin}`"))?;

    let stdout = child.stdout.take().context("harness stdout unavailable")?;
    let stderr = child.stderr.take().context("harness stderr unavailable")?;

    // Keep a bounded stderr tail so a crashing harness leaves a trail.
    let stderr_capture = Arc::new(Mutex::new(Vec::<u8>::new()));
    let stderr_truncated = Arc::new(AtomicBool::new(false));
    let stderr_task = {
        let stderr_capture = stderr_capture.clone();
        let stderr_truncated = stderr_truncated.clone();
        tokio::spawn(async move {
            const LIMIT_BYTES: usize = 32 * 1024;
            let mut stderr = stderr;
            let mut buf = [0u8; 4096];

            loop {
                let n = stderr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }

                let mut capture = match stderr_capture.lock() {
                    Ok(guard) => guard,
                    Err(err) => err.into_inner(),
                };
                let remaining = LIMIT_BYTES.saturating_sub(capture.len());
                if remaining == 0 {
                    stderr_truncated.store(true, Ordering::Relaxed);
                    continue;
                }

                let take = remaining.min(n);
                capture.extend_from_slice(&buf[..take]);
                if take < n {
                    stderr_truncated.store(true, Ordering::Relaxed);
                }
            }

            Ok::<(), std::io::Error>(())
        })
    };

    // Token accounting rides the harness stream-json stdout.
    let stdout_task = tokio::spawn(async move {
        let mut accumulator = TokenAccumulator::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            accumulator.observe_line(&line);
        }
        accumulator
    });

    let mut printer = FeedPrinter::new();
    let mut changes = facade.subscribe();
    let mut interrupt_requested = false;
    let mut interrupt_sent = false;

    let exit_code = loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("wait on harness")?;
                break status.code().unwrap_or(1);
            }
            changed = changes.changed() => {
                if changed.is_ok() {
                    printer.print_new(&facade.items());
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupt_sent => {
                interrupt_requested = true;
            }
        }

        if interrupt_requested && !interrupt_sent {
            tracing::info!("interrupt received, stopping harness");
            let _ = child.start_kill();
            interrupt_sent = true;
        }
    };

    // Harness is gone; apply whatever the broker already received, then
    // print the tail of the feed.
    facade.flush().await;
    printer.print_new(&facade.items());

    let accumulator = stdout_task.await.unwrap_or_default();
    let usage = accumulator.finish();
    record_final_tokens(&facade, usage);

    let _ = stderr_task.await;
    report_harness_stderr(exit_code, &stderr_capture, &stderr_truncated);

    facade.shutdown().await;

    if let Err(err) = persist_dialog_rules(&project_dir, &facade) {
        tracing::warn!("failed to persist permission-dialog rules: {err:#}");
    }
    if let Err(err) = update_session_meta(&session, label, &facade) {
        tracing::warn!("failed to update session index: {err:#}");
    }
    if facade.is_degraded() {
        tracing::warn!(
            reason = facade.degraded_reason().unwrap_or_default(),
            "session persistence was degraded; resume will see a truncated tail"
        );
    }

    Ok(exit_code)
}

fn record_final_tokens(facade: &FeedFacade, usage: TokenUsage) {
    if usage.is_zero() {
        return;
    }
    let adapter_session_id = facade
        .session()
        .map(|session| session.session_id)
        .unwrap_or_else(|| "harness".to_string());
    facade.record_tokens(&adapter_session_id, usage);
}

fn report_harness_stderr(
    exit_code: i32,
    capture: &Arc<Mutex<Vec<u8>>>,
    truncated: &Arc<AtomicBool>,
) {
    if exit_code == 0 {
        return;
    }
    let stderr = {
        let capture = match capture.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        String::from_utf8_lossy(&capture).to_string()
    };
    let stderr = stderr.trim_end_matches(['\n', '\r']);
    if stderr.is_empty() {
        return;
    }
    eprintln!("harness stderr:");
    eprintln!("{stderr}");
    if truncated.load(Ordering::Relaxed) {
        eprintln!("[stderr truncated]");
    }
}

/// Rules the operator added through the permission dialog survive into the
/// project config so the next session starts with them.
fn persist_dialog_rules(project_dir: &std::path::Path, facade: &FeedFacade) -> anyhow::Result<()> {
    let config = ConfigStore::for_project(project_dir);
    for rule in facade.rules() {
        if rule.added_by != RULE_ADDED_BY_PERMISSION_DIALOG {
            continue;
        }
        let stored = StoredRule {
            tool_name: rule.tool_name,
            action: match rule.action {
                athena_feed::rules::RuleAction::Approve => "approve".to_string(),
                athena_feed::rules::RuleAction::Deny => "deny".to_string(),
            },
            added_by: rule.added_by,
        };
        if !config.contains_rule(&stored)? {
            config.append_rule(&stored)?;
        }
    }
    Ok(())
}

fn update_session_meta(
    session: &SessionPaths,
    label: Option<String>,
    facade: &FeedFacade,
) -> anyhow::Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let (adapter_session_ids, event_count) = facade.session_summary();

    let existing = read_meta(&session.meta_path).ok();
    let meta = SessionMeta {
        id: session.session_id.clone(),
        label: label.or_else(|| existing.as_ref().and_then(|meta| meta.label.clone())),
        created_at: existing.as_ref().map_or(now_ms, |meta| meta.created_at),
        updated_at: now_ms,
        adapter_session_ids,
        event_count: Some(event_count),
    };
    write_meta(session, &meta)
}
