//! Flock daemon
//!
//! Runs Claude CLI workers for a project directory and prints scheduler
//! events to stdout as JSON lines. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use flock_core::config::{Config, load_config};
use flock_daemon::orchestration::{
    AgentScheduler, InteractiveOptions, ProcessTracker, SchedulerDeps, SchedulerEvent,
    StartOutcome,
};
use flock_daemon::store::{
    ConfigSettings, DefaultInstructions, DefaultPermissionArgs, MemoryConversationStore,
    MemoryProjectStore, Project,
};

#[derive(Parser, Debug)]
#[command(name = "flock-daemon")]
#[command(version, about = "Flock daemon - Claude CLI worker supervisor")]
struct Args {
    /// Path to the `claude` CLI binary
    #[arg(long, global = true, env = "FLOCK_CLAUDE_BIN")]
    claude_bin: Option<PathBuf>,

    /// Maximum concurrently running agents
    #[arg(long, global = true, env = "FLOCK_MAX_AGENTS")]
    max_agents: Option<usize>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "FLOCK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "FLOCK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one agent in a project directory until it exits.
    Run {
        /// Project working directory
        #[arg(long)]
        project_dir: PathBuf,

        /// Keep stdin open and forward each line as a user message
        #[arg(long, short)]
        interactive: bool,

        /// Instructions (required for autonomous runs)
        #[arg(long, short)]
        prompt: Option<String>,

        /// Session to resume in interactive mode
        #[arg(long)]
        session_id: Option<String>,

        /// Permission mode override (e.g. "plan")
        #[arg(long)]
        permission_mode: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Kill worker processes left behind by a previous daemon.
    CleanupOrphans {
        /// Pid table written by the process tracker
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.command {
        Command::Run { project_dir, .. } => Some(project_dir.as_path()),
        Command::CleanupOrphans { .. } => None,
    };
    let mut config = load_config(project_dir).context("Failed to load configuration")?;
    apply_cli_overrides(&mut config, &args);

    let log_filter = format!("flock_daemon={0},flock_core={0}", config.daemon.log_level);
    flock_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_agents = config.daemon.max_concurrent_agents,
        claude_bin = %config.daemon.claude_bin.display(),
        "Starting flock-daemon"
    );

    match args.command {
        Command::CleanupOrphans { state_file } => {
            let path = state_file
                .or_else(|| config.daemon.tracker_state_path.clone())
                .context("No tracker state file given or configured")?;
            let tracker = ProcessTracker::with_state_file(&path, recheck_delay(&config))?;
            let report = tracker.cleanup_orphan_processes().await;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Command::Run {
            project_dir,
            interactive,
            prompt,
            session_id,
            permission_mode,
            model,
        } => {
            let opts = RunOptions {
                interactive,
                prompt,
                interactive_opts: InteractiveOptions {
                    session_id,
                    message: None,
                    permission_mode,
                    model,
                },
            };
            run(config, &project_dir, opts).await
        }
    }
}

struct RunOptions {
    interactive: bool,
    prompt: Option<String>,
    interactive_opts: InteractiveOptions,
}

fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(ref bin) = args.claude_bin {
        config.daemon.claude_bin.clone_from(bin);
    }
    if let Some(max) = args.max_agents {
        config.daemon.max_concurrent_agents = max;
    }
    if let Some(ref level) = args.log_level {
        config.daemon.log_level.clone_from(level);
    }
}

fn recheck_delay(config: &Config) -> Duration {
    Duration::from_millis(config.daemon.orphan_recheck_delay_ms)
}

#[allow(clippy::print_stdout)]
async fn run(config: Config, project_dir: &Path, opts: RunOptions) -> anyhow::Result<()> {
    let project_dir = project_dir
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project_dir.display()))?;
    let name = project_dir
        .file_name()
        .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());

    let tracker = match config.daemon.tracker_state_path {
        Some(ref path) => {
            let tracker = ProcessTracker::with_state_file(path, recheck_delay(&config))?;
            let report = tracker.cleanup_orphan_processes().await;
            if report.killed + report.failed > 0 {
                warn!(killed = report.killed, failed = report.failed, "Cleaned up orphaned workers");
            }
            tracker
        }
        None => ProcessTracker::new(recheck_delay(&config)),
    };

    let projects = MemoryProjectStore::new();
    projects
        .insert(Project::new(name.clone(), name.clone(), project_dir))
        .await;
    let scheduler = AgentScheduler::new(
        SchedulerDeps {
            projects: Arc::new(projects),
            conversations: Arc::new(MemoryConversationStore::new()),
            settings: Arc::new(ConfigSettings::new(config)),
            permissions: Arc::new(DefaultPermissionArgs),
            instructions: Arc::new(DefaultInstructions),
        },
        Arc::new(tracker),
    );
    let mut events = scheduler.subscribe();

    if opts.interactive {
        let session_id = scheduler
            .start_interactive_agent(&name, opts.interactive_opts)
            .await?;
        info!(project_id = %name, %session_id, "Interactive agent started");
        tokio::spawn(forward_stdin(scheduler.clone(), name.clone()));
    } else {
        let prompt = opts
            .prompt
            .context("--prompt is required for autonomous runs")?;
        if let StartOutcome::Queued { position } = scheduler.start_agent(&name, &prompt).await? {
            info!(project_id = %name, position, "Agent queued");
        }
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();
    tokio::pin!(sigterm_future);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if let SchedulerEvent::Exit { ref project_id, .. } = event
                        && *project_id == name
                        && !scheduler.running_projects().await.contains(&name)
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = &mut sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }

    scheduler.stop_all_agents().await;
    info!("Daemon stopped");
    Ok(())
}

/// Forward stdin lines to the interactive agent; EOF stops it.
async fn forward_stdin(scheduler: AgentScheduler, project_id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                if let Err(e) = scheduler.send_input(&project_id, &line, &[]).await {
                    warn!(%project_id, error = %e, "Failed to send input");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    if let Err(e) = scheduler.stop_agent(&project_id).await {
        info!(%project_id, error = %e, "Agent already stopped");
    }
}
