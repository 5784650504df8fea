//! Supervisor for one Claude CLI worker process.
//!
//! An [`AgentProcess`] owns exactly one child process and one
//! [`StreamParser`]. Output is decoded on a reader task and delivered, in
//! arrival order, over the unbounded event channel returned by
//! [`AgentProcess::new`]. Input goes through a dedicated stdin writer task so
//! callers never block on the pipe.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use flock_core::config::Config;
use flock_core::ndjson::{
    ContextUsage, DomainMessage, MessageKind, ParserEvent, StreamParser, now_millis,
};

use super::args::{self, PermissionArgs};
use super::kill::{KillSignal, kill_tree};

/// Substring of the worker's stderr when another process holds the session.
const SESSION_CONFLICT_MARKER: &str = "already in use";

/// How long to wait for the output readers to drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor errors, all reported synchronously at the call boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Agent is not running")]
    NotRunning,

    #[error("Agent stdin is not available")]
    StdinUnavailable,

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Runs from a single instruction; stdin is closed after it.
    Autonomous,
    /// Stays open for follow-up input.
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub project_id: String,
    pub working_dir: PathBuf,
    pub claude_bin: PathBuf,
    pub mode: AgentMode,
    pub session_id: Option<String>,
    /// `--session-id` when true, `--resume` otherwise.
    pub is_new_session: bool,
    pub model: Option<String>,
    pub permissions: PermissionArgs,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub include_partial_messages: bool,
    pub no_session_persistence: bool,
    pub plugin_dirs: Vec<PathBuf>,
    pub mcp_servers: BTreeMap<String, Value>,
    pub max_context_tokens: u64,
    pub terminate_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        project_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        mode: AgentMode,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            working_dir: working_dir.into(),
            claude_bin: PathBuf::from("claude"),
            mode,
            session_id: None,
            is_new_session: true,
            model: None,
            permissions: PermissionArgs {
                permission_mode: "default".to_string(),
                ..PermissionArgs::default()
            },
            max_turns: None,
            max_budget_usd: None,
            include_partial_messages: true,
            no_session_persistence: false,
            plugin_dirs: Vec::new(),
            mcp_servers: BTreeMap::new(),
            max_context_tokens: 200_000,
            terminate_timeout: Duration::from_secs(5),
        }
    }

    /// Fill daemon and agent defaults from settings.
    #[must_use]
    pub fn with_settings(mut self, settings: &Config) -> Self {
        self.claude_bin.clone_from(&settings.daemon.claude_bin);
        self.terminate_timeout = Duration::from_secs(settings.daemon.terminate_timeout_secs);
        self.model.clone_from(&settings.agents.default_model);
        self.max_turns = settings.agents.max_turns;
        self.max_budget_usd = settings.agents.max_budget_usd;
        self.include_partial_messages = settings.agents.include_partial_messages;
        self.no_session_persistence = settings.agents.no_session_persistence;
        self.plugin_dirs.clone_from(&settings.agents.plugin_dirs);
        self.mcp_servers.clone_from(&settings.agents.mcp_servers);
        self.max_context_tokens = settings.agents.max_context_tokens;
        self
    }
}

/// An image sent alongside user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Outcome of [`AgentProcess::send_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    /// Written to the worker immediately.
    Sent,
    /// A turn is in flight; queued at this 1-based position.
    Queued { position: usize },
}

/// Events emitted by one supervisor, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message(DomainMessage),
    Status(AgentStatus),
    SessionId(String),
    WaitingForInput { is_waiting: bool, version: u64 },
    ContextUsage(ContextUsage),
    /// The worker asked to enter plan mode while not already in it.
    EnterPlanMode,
    ExitPlanMode { plan: String },
    SessionNotFound(String),
    Error(String),
    /// The process is gone; always the last event.
    Exit { code: Option<i32> },
}

/// Point-in-time copy of a worker's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub project_id: String,
    pub mode: AgentMode,
    pub status: AgentStatus,
    pub permission_mode: String,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub context_usage: ContextUsage,
    pub processing: bool,
    pub waiting_for_input: bool,
    pub queued_inputs: Vec<String>,
    pub pid: Option<u32>,
    pub working_dir: PathBuf,
    pub started_at: Option<u64>,
    pub is_stopping: bool,
    pub session_conflict: bool,
}

#[derive(Debug, Clone)]
struct QueuedInput {
    text: String,
    images: Vec<ImageAttachment>,
}

#[derive(Debug)]
struct WorkerState {
    status: AgentStatus,
    session_id: Option<String>,
    context_usage: ContextUsage,
    processing: bool,
    waiting_for_input: bool,
    queued_inputs: Vec<QueuedInput>,
    pid: Option<u32>,
    started_at: Option<u64>,
    stdin: Option<mpsc::UnboundedSender<String>>,
    mcp_config_path: Option<PathBuf>,
    session_conflict: bool,
}

struct Shared {
    config: AgentConfig,
    state: Mutex<WorkerState>,
    parser: Mutex<StreamParser>,
    events: mpsc::UnboundedSender<AgentEvent>,
    /// Set once a stop was requested; output still in the pipes is dropped.
    detached: AtomicBool,
    stopping: AtomicBool,
    exit_tx: watch::Sender<Option<Option<i32>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one supervised worker process.
pub struct AgentProcess {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("project_id", &self.shared.config.project_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl AgentProcess {
    /// Create a stopped supervisor and the receiver for its events.
    pub fn new(config: AgentConfig) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (exit_tx, _) = watch::channel(None);
        let parser = StreamParser::new(config.max_context_tokens);
        let usage = parser.context_usage();
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState {
                status: AgentStatus::Stopped,
                session_id: config.session_id.clone(),
                context_usage: usage,
                processing: false,
                waiting_for_input: false,
                queued_inputs: Vec::new(),
                pid: None,
                started_at: None,
                stdin: None,
                mcp_config_path: None,
                session_conflict: false,
            }),
            parser: Mutex::new(parser),
            config,
            events,
            detached: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            exit_tx,
        });
        (Self { shared }, rx)
    }

    /// Spawn the worker and hand it `instructions` as the first turn.
    ///
    /// A no-op when already running. In interactive mode an empty
    /// `instructions` starts the worker idle, waiting for [`send_input`].
    ///
    /// [`send_input`]: Self::send_input
    pub fn start(&self, instructions: &str) -> Result<(), ProcessError> {
        let shared = &self.shared;
        let config = &shared.config;
        {
            let mut state = lock(&shared.state);
            if state.status == AgentStatus::Running {
                debug!(project_id = %config.project_id, "Agent already running");
                return Ok(());
            }
            state.status = AgentStatus::Running;
        }
        shared.detached.store(false, Ordering::SeqCst);
        shared.stopping.store(false, Ordering::SeqCst);
        shared.exit_tx.send_replace(None);

        match self.spawn(instructions) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(project_id = %config.project_id, error = %e, "Failed to start agent");
                let mcp_path = {
                    let mut state = lock(&shared.state);
                    state.status = AgentStatus::Error;
                    state.mcp_config_path.take()
                };
                if let Some(path) = mcp_path {
                    args::remove_mcp_config(&path);
                }
                shared.emit(AgentEvent::Message(DomainMessage::new(
                    MessageKind::Stderr,
                    e.to_string(),
                )));
                shared.emit(AgentEvent::Status(AgentStatus::Error));
                Err(e)
            }
        }
    }

    fn spawn(&self, instructions: &str) -> Result<(), ProcessError> {
        let shared = &self.shared;
        let config = &shared.config;

        let mcp_path = if config.mcp_servers.is_empty() {
            None
        } else {
            let path = args::write_mcp_config(&config.mcp_servers)?;
            lock(&shared.state).mcp_config_path = Some(path.clone());
            Some(path)
        };
        let argv = args::build_args(config, mcp_path.as_deref());
        let command_line = args::build_command_line(&config.claude_bin, &argv);

        let mut cmd = shell_command(&command_line);
        cmd.current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            project_id = %config.project_id,
            mode = ?config.mode,
            cwd = %config.working_dir.display(),
            session_id = ?config.session_id,
            "Spawning agent process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stderr not captured".into()))?;

        let stdin_tx = spawn_stdin_writer(config.project_id.clone(), stdin);
        let stdout_task = tokio::spawn(read_stdout(Arc::clone(shared), stdout));
        let stderr_task = tokio::spawn(read_stderr(Arc::clone(shared), stderr));

        let has_instructions = !instructions.is_empty() || config.mode == AgentMode::Autonomous;
        {
            let mut state = lock(&shared.state);
            state.pid = pid;
            state.started_at = Some(now_millis());
            state.processing = has_instructions;
            state.stdin = match config.mode {
                AgentMode::Interactive => Some(stdin_tx.clone()),
                AgentMode::Autonomous => None,
            };
        }

        shared.emit(AgentEvent::Status(AgentStatus::Running));
        shared.emit(AgentEvent::Message(DomainMessage::new(
            MessageKind::System,
            format!("Permission mode: {}", permission_label(&config.permissions)),
        )));

        if has_instructions {
            shared.emit(AgentEvent::Message(DomainMessage::new(
                MessageKind::User,
                instructions,
            )));
            stdin_tx
                .send(build_envelope(instructions, &[]))
                .map_err(|_| ProcessError::StdinUnavailable)?;
        }
        if config.mode == AgentMode::Autonomous {
            debug!(project_id = %config.project_id, "Closing stdin after initial instructions");
        }
        drop(stdin_tx);

        tokio::spawn(monitor(Arc::clone(shared), child, stdout_task, stderr_task));
        info!(project_id = %config.project_id, pid = ?pid, "Agent process started");
        Ok(())
    }

    /// Stop the worker: terminate its process group, escalate to a kill after
    /// the configured grace period, and wait for the exit.
    ///
    /// Concurrent and repeated calls are safe; only the first one signals,
    /// every caller returns once the process is gone.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let Some(pid) = lock(&shared.state).pid else {
            return;
        };
        let mut exit_rx = shared.exit_tx.subscribe();

        if shared.stopping.swap(true, Ordering::SeqCst) {
            debug!(project_id = %shared.config.project_id, "Stop already in progress");
            let _ = exit_rx.wait_for(Option::is_some).await;
            return;
        }

        shared.detached.store(true, Ordering::SeqCst);
        lock(&shared.state).stdin = None;
        info!(project_id = %shared.config.project_id, pid, "Stopping agent");

        if let Err(e) = kill_tree(pid, KillSignal::Terminate) {
            debug!(pid, error = %e, "Terminate signal not delivered");
        }

        let exited = tokio::time::timeout(
            shared.config.terminate_timeout,
            exit_rx.wait_for(Option::is_some),
        )
        .await
        .is_ok();

        if !exited {
            warn!(project_id = %shared.config.project_id, pid, "Grace period expired, killing agent");
            if let Err(e) = kill_tree(pid, KillSignal::Kill) {
                debug!(pid, error = %e, "Kill signal not delivered");
            }
            let _ = exit_rx.wait_for(Option::is_some).await;
        }
    }

    /// Send a follow-up message. Queued when a turn is already in flight.
    pub fn send_input(
        &self,
        text: &str,
        images: &[ImageAttachment],
    ) -> Result<InputDisposition, ProcessError> {
        let stdin = {
            let mut state = lock(&self.shared.state);
            if state.status != AgentStatus::Running {
                return Err(ProcessError::NotRunning);
            }
            let stdin = state
                .stdin
                .clone()
                .filter(|tx| !tx.is_closed())
                .ok_or(ProcessError::StdinUnavailable)?;
            if state.processing {
                state.queued_inputs.push(QueuedInput {
                    text: text.to_string(),
                    images: images.to_vec(),
                });
                let position = state.queued_inputs.len();
                debug!(project_id = %self.shared.config.project_id, position, "Queued input");
                return Ok(InputDisposition::Queued { position });
            }
            state.processing = true;
            stdin
        };
        self.shared.dispatch(&stdin, text, images)?;
        Ok(InputDisposition::Sent)
    }

    /// Remove a queued input by 0-based index. Returns `false` when out of
    /// range.
    pub fn remove_queued_message(&self, index: usize) -> bool {
        let mut state = lock(&self.shared.state);
        if index >= state.queued_inputs.len() {
            return false;
        }
        state.queued_inputs.remove(index);
        true
    }

    pub fn queued_messages(&self) -> Vec<String> {
        lock(&self.shared.state)
            .queued_inputs
            .iter()
            .map(|q| q.text.clone())
            .collect()
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait_for_exit(&self) -> Option<i32> {
        let mut rx = self.shared.exit_tx.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|code| *code)?
    }

    pub fn status(&self) -> AgentStatus {
        lock(&self.shared.state).status
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.state).pid
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.shared.state).session_id.clone()
    }

    pub fn context_usage(&self) -> ContextUsage {
        lock(&self.shared.state).context_usage
    }

    pub fn project_id(&self) -> &str {
        &self.shared.config.project_id
    }

    pub fn mode(&self) -> AgentMode {
        self.shared.config.mode
    }

    pub fn permission_mode(&self) -> &str {
        &self.shared.config.permissions.permission_mode
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let config = &self.shared.config;
        let state = lock(&self.shared.state);
        WorkerSnapshot {
            project_id: config.project_id.clone(),
            mode: config.mode,
            status: state.status,
            permission_mode: config.permissions.permission_mode.clone(),
            model: config.model.clone(),
            session_id: state.session_id.clone(),
            context_usage: state.context_usage,
            processing: state.processing,
            waiting_for_input: state.waiting_for_input,
            queued_inputs: state.queued_inputs.iter().map(|q| q.text.clone()).collect(),
            pid: state.pid,
            working_dir: config.working_dir.clone(),
            started_at: state.started_at,
            is_stopping: self.shared.stopping.load(Ordering::SeqCst),
            session_conflict: state.session_conflict,
        }
    }
}

impl Shared {
    fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            debug!(project_id = %self.config.project_id, "Agent event receiver dropped");
        }
    }

    /// Start a new turn with `text`. The caller has already set `processing`.
    fn dispatch(
        &self,
        stdin: &mpsc::UnboundedSender<String>,
        text: &str,
        images: &[ImageAttachment],
    ) -> Result<(), ProcessError> {
        let waiting = {
            let mut parser = lock(&self.parser);
            parser.reset_turn();
            parser.set_waiting_for_input(false)
        };
        self.apply(waiting);
        self.emit(AgentEvent::Message(DomainMessage::new(MessageKind::User, text)));
        stdin
            .send(build_envelope(text, images))
            .map_err(|_| ProcessError::StdinUnavailable)
    }

    fn handle_chunk(&self, chunk: &[u8]) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let events = lock(&self.parser).push(chunk);
        for event in events {
            self.apply(event);
        }
    }

    fn flush_parser(&self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let events = lock(&self.parser).finish();
        for event in events {
            self.apply(event);
        }
    }

    /// Fold one parser event into worker state and forward it.
    fn apply(&self, event: ParserEvent) {
        match event {
            ParserEvent::Message(message) => self.emit(AgentEvent::Message(message)),
            ParserEvent::SessionInit { session_id, model } => {
                debug!(project_id = %self.config.project_id, ?model, "Worker session initialised");
                if let Some(id) = session_id {
                    lock(&self.state).session_id = Some(id.clone());
                    self.emit(AgentEvent::SessionId(id));
                }
            }
            ParserEvent::UsageUpdated(usage) => {
                lock(&self.state).context_usage = usage;
                self.emit(AgentEvent::ContextUsage(usage));
            }
            ParserEvent::WaitingForInput {
                is_waiting,
                version,
            } => {
                lock(&self.state).waiting_for_input = is_waiting;
                self.emit(AgentEvent::WaitingForInput {
                    is_waiting,
                    version,
                });
            }
            ParserEvent::EnterPlanMode => {
                if self.config.permissions.permission_mode != "plan" {
                    self.emit(AgentEvent::EnterPlanMode);
                }
            }
            ParserEvent::ExitPlanMode { plan } => self.emit(AgentEvent::ExitPlanMode { plan }),
            ParserEvent::SessionNotFound(id) => {
                warn!(project_id = %self.config.project_id, session_id = %id, "Worker reported unknown session");
                self.emit(AgentEvent::SessionNotFound(id));
            }
            ParserEvent::TurnComplete { is_error } => self.on_turn_complete(is_error),
            ParserEvent::Error(message) => self.emit(AgentEvent::Error(message)),
        }
    }

    fn on_turn_complete(&self, is_error: bool) {
        let next = {
            let mut state = lock(&self.state);
            state.processing = false;
            let stdin = state.stdin.clone();
            match stdin {
                Some(stdin) if !state.queued_inputs.is_empty() => {
                    state.processing = true;
                    Some((stdin, state.queued_inputs.remove(0)))
                }
                _ => None,
            }
        };
        debug!(project_id = %self.config.project_id, is_error, "Turn complete");

        if let Some((stdin, input)) = next
            && let Err(e) = self.dispatch(&stdin, &input.text, &input.images)
        {
            warn!(project_id = %self.config.project_id, error = %e, "Failed to send queued input");
            lock(&self.state).processing = false;
        }
    }

    fn on_exit(&self, result: std::io::Result<std::process::ExitStatus>) {
        let code = match result {
            Ok(status) => status.code(),
            Err(ref e) => {
                self.emit(AgentEvent::Message(DomainMessage::new(
                    MessageKind::Stderr,
                    format!("Failed to wait for agent process: {e}"),
                )));
                None
            }
        };

        let stopping = self.stopping.load(Ordering::SeqCst);
        let status = if stopping || code == Some(0) {
            AgentStatus::Stopped
        } else {
            AgentStatus::Error
        };
        let mcp_path = {
            let mut state = lock(&self.state);
            state.status = status;
            state.processing = false;
            state.stdin = None;
            state.pid = None;
            state.mcp_config_path.take()
        };
        if let Some(path) = mcp_path {
            args::remove_mcp_config(&path);
        }

        info!(project_id = %self.config.project_id, ?code, ?status, "Agent process exited");
        self.emit(AgentEvent::Status(status));
        self.emit(AgentEvent::Exit { code });
        self.exit_tx.send_replace(Some(code));
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(format!("exec {command_line}"));
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(command_line);
    cmd
}

fn permission_label(perms: &PermissionArgs) -> &str {
    if perms.skip_permissions {
        "bypassPermissions"
    } else {
        &perms.permission_mode
    }
}

/// One newline-terminated stream-json user message.
///
/// Text that is itself a JSON array is sent as structured content;
/// attached images always produce a multimodal array.
pub fn build_envelope(text: &str, images: &[ImageAttachment]) -> String {
    let content = if images.is_empty() {
        match serde_json::from_str::<Value>(text) {
            Ok(array @ Value::Array(_)) => array,
            _ => Value::String(text.to_string()),
        }
    } else {
        let mut blocks = vec![serde_json::json!({"type": "text", "text": text})];
        blocks.extend(images.iter().map(|img| {
            serde_json::json!({
                "type": "image",
                "source": {"type": "base64", "media_type": img.media_type, "data": img.data}
            })
        }));
        Value::Array(blocks)
    };
    let envelope = serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": content}
    });
    format!("{envelope}\n")
}

fn spawn_stdin_writer(
    project_id: String,
    mut stdin: tokio::process::ChildStdin,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(%project_id, error = %e, "Failed to write to agent stdin");
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!(%project_id, error = %e, "Failed to flush agent stdin");
                break;
            }
        }
        debug!(%project_id, "Agent stdin closed");
    });
    tx
}

async fn read_stdout(shared: Arc<Shared>, mut stdout: ChildStdout) {
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => shared.handle_chunk(&buf[..n]),
            Err(e) => {
                warn!(project_id = %shared.config.project_id, error = %e, "Error reading agent stdout");
                break;
            }
        }
    }
    shared.flush_parser();
}

async fn read_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if shared.detached.load(Ordering::SeqCst) || line.trim().is_empty() {
                    continue;
                }
                warn!(project_id = %shared.config.project_id, stderr = %line, "Agent stderr");
                if line.contains(SESSION_CONFLICT_MARKER) {
                    lock(&shared.state).session_conflict = true;
                }
                shared.emit(AgentEvent::Message(DomainMessage::new(
                    MessageKind::Stderr,
                    line,
                )));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(project_id = %shared.config.project_id, error = %e, "Error reading agent stderr");
                break;
            }
        }
    }
}

async fn monitor(
    shared: Arc<Shared>,
    mut child: tokio::process::Child,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
) {
    let result = child.wait().await;
    let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    })
    .await;
    if drained.is_err() {
        debug!(project_id = %shared.config.project_id, "Output readers still open after exit");
    }
    shared.on_exit(result);
}
