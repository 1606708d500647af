mod atomic_write;
mod config;
mod printer;
mod sessions;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use athena_feed::rules::RuleAction;
use athena_feed::rules::RuleSet;
use athena_protocol::InstanceId;
use athena_protocol::new_session_id;
use athena_protocol::tokens::format_tokens_compact;
use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(author = "Athena", version, about = "Supervise a coding-assistant harness")]
struct Cli {
    /// Path to the harness binary to supervise.
    #[arg(long, env = "ATHENA_HARNESS_BIN", default_value = "claude", global = true)]
    harness_bin: String,

    /// Project directory. Defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Instance id for the hook socket. Defaults to this process id.
    #[arg(long, global = true)]
    instance_id: Option<String>,

    /// Auto-passthrough deadline in milliseconds.
    ///
    /// Must stay below the harness forwarder timeout so our decision always
    /// reaches the harness first.
    #[arg(long, default_value = "200", global = true)]
    auto_passthrough_ms: u64,

    /// Resume a recorded Athena session by id.
    #[arg(long, global = true)]
    resume: Option<String>,

    /// Optional label for the session index.
    #[arg(long, global = true)]
    label: Option<String>,

    /// Arguments passed through to the harness, after `--`.
    #[arg(last = true)]
    harness_args: Vec<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List recorded sessions for this project, newest first.
    Sessions,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("athena_cli=info,athena_feed=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve the harness binary: explicit paths are used as-is, bare names go
/// through PATH lookup so a missing harness fails before we spawn anything.
fn resolve_harness_bin(bin: &str) -> anyhow::Result<String> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        return Ok(bin.to_string());
    }
    let resolved = which::which(bin)
        .with_context(|| format!("harness binary `{bin}` not found on PATH"))?;
    Ok(resolved.display().to_string())
}

/// Seed the in-memory rule set from global config first, then project
/// config, so project rules win on equal precedence (first deny wins).
fn load_rules(project_dir: &std::path::Path) -> RuleSet {
    let mut rules = RuleSet::new();
    let mut sources = Vec::new();
    if let Ok(global) = config::ConfigStore::global() {
        sources.push(global);
    }
    sources.push(config::ConfigStore::for_project(project_dir));

    for source in sources {
        let stored = match source.load_rules() {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(path = %source.path().display(), "failed to load rules: {err:#}");
                continue;
            }
        };
        for rule in stored {
            let action = match rule.action.as_str() {
                "deny" => RuleAction::Deny,
                _ => RuleAction::Approve,
            };
            rules.add(rule.tool_name, action, rule.added_by);
        }
    }
    rules
}

fn list_sessions(project_dir: &std::path::Path) -> anyhow::Result<()> {
    let rows = sessions::discover_sessions(project_dir).context("discover sessions")?;
    if rows.is_empty() {
        println!("no recorded sessions");
        return Ok(());
    }
    for row in rows {
        let label = row.label.as_deref().unwrap_or("-");
        let events = row.event_count.unwrap_or(0);
        println!(
            "{}  events={}  label={}  adapters={}",
            row.id,
            format_tokens_compact(events),
            label,
            row.adapter_session_ids.len()
        );
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    if let Some(CliCommand::Sessions) = cli.command {
        return list_sessions(&project_dir);
    }

    let harness_bin = resolve_harness_bin(&cli.harness_bin)?;
    let instance_id = match cli.instance_id {
        Some(id) => InstanceId::from_string(id),
        None => InstanceId::from_string(std::process::id().to_string()),
    };

    let session_id = match &cli.resume {
        Some(session_id) => session_id.clone(),
        None => new_session_id(),
    };
    let session = sessions::session_paths(&project_dir, &session_id);
    if cli.resume.is_some() && !session.store_path.is_file() {
        anyhow::bail!("no recorded session {session_id} under {}", project_dir.display());
    }

    let rules = load_rules(&project_dir);

    let exit_code = supervisor::run_supervisor(supervisor::SupervisorConfig {
        project_dir,
        harness_bin,
        harness_args: cli.harness_args,
        instance_id,
        auto_passthrough: Duration::from_millis(cli.auto_passthrough_ms),
        session,
        label: cli.label,
        rules,
    })
    .await?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
