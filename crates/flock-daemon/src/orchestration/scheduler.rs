//! Agent scheduler.
//!
//! Multiplexes projects onto a bounded number of concurrently running
//! workers. Autonomous starts queue when every slot is taken; interactive
//! starts fail instead, since a queued interactive session would stall a
//! human. A freed slot (worker exit) or a raised limit drains the queue in
//! FIFO order.
//!
//! Every worker gets a forwarder task that persists its messages through the
//! [`WriteSerializer`] (keyed by project) and re-broadcasts its events as
//! [`SchedulerEvent`]s tagged with the project id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use flock_core::ndjson::{ContextUsage, DomainMessage, MessageKind, now_millis};

use super::serializer::WriteSerializer;
use super::tracker::ProcessTracker;
use crate::store::policy::PLAN_MODE;
use crate::store::{
    ConversationStore, InstructionGenerator, PermissionArgsGenerator, PermissionOverrides,
    Project, ProjectStore, SettingsProvider, StoreError,
};
use crate::subprocess::{
    AgentConfig, AgentEvent, AgentMode, AgentProcess, AgentStatus, ImageAttachment,
    InputDisposition, ProcessError, WorkerSnapshot,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Instruction sent to a worker restarted in plan mode.
const CONTINUE_INSTRUCTION: &str = "Continue";

const ONE_OFF_PREFIX: &str = "oneoff-";

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Collaborators the scheduler depends on.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub projects: Arc<dyn ProjectStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub settings: Arc<dyn SettingsProvider>,
    pub permissions: Arc<dyn PermissionArgsGenerator>,
    pub instructions: Arc<dyn InstructionGenerator>,
}

/// Call-boundary rejections.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("An agent is already running for project {0}")]
    AlreadyRunning(String),

    #[error("Project {0} is already queued")]
    AlreadyQueued(String),

    #[error("No agent is running for {0}")]
    NotRunning(String),

    #[error("Agent for project {0} is not interactive")]
    NotInteractive(String),

    #[error("Agent stdin is unavailable for {0}")]
    StdinUnavailable(String),

    #[error("All {max} agent slots are in use")]
    CapacityReached { max: usize },

    #[error("One-off agent not found: {0}")]
    OneOffNotFound(String),

    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    fn from_process(key: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::NotRunning => Self::NotRunning(key.to_string()),
            ProcessError::StdinUnavailable => Self::StdinUnavailable(key.to_string()),
            ProcessError::SpawnFailed(msg) => Self::Spawn(msg),
            ProcessError::Io(e) => Self::Spawn(e.to_string()),
        }
    }
}

/// A project waiting for a free slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub project_id: String,
    pub instructions: String,
    /// Milliseconds since the Unix epoch.
    pub enqueued_at: u64,
}

/// Result of [`AgentScheduler::start_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// 1-based queue position.
    Queued { position: usize },
}

#[derive(Debug, Clone, Default)]
pub struct InteractiveOptions {
    /// Session to resume. Falls back to the project's current conversation.
    pub session_id: Option<String>,
    /// First message; the worker starts idle without one.
    pub message: Option<String>,
    pub permission_mode: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OneOffRequest {
    pub project_id: String,
    pub message: String,
    pub label: Option<String>,
}

/// Events delivered to the hosting application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Message {
        project_id: String,
        message: DomainMessage,
    },
    Status {
        project_id: String,
        status: AgentStatus,
    },
    Exit {
        project_id: String,
        code: Option<i32>,
    },
    WaitingForInput {
        project_id: String,
        is_waiting: bool,
        version: u64,
    },
    SessionNotFound {
        project_id: String,
        session_id: String,
    },
    SessionRecovery {
        project_id: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    QueueChange {
        entries: Vec<QueueEntry>,
    },
    ExitPlanMode {
        project_id: String,
        plan: String,
    },
    OneOffMessage {
        handle: String,
        project_id: String,
        message: DomainMessage,
    },
    OneOffStatus {
        handle: String,
        status: AgentStatus,
    },
    OneOffExit {
        handle: String,
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OneOffSnapshot {
    pub handle: String,
    pub label: Option<String>,
    pub conversation_id: String,
    pub worker: WorkerSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub max_concurrent_agents: usize,
    pub running: Vec<WorkerSnapshot>,
    pub queue: Vec<QueueEntry>,
    pub one_offs: Vec<OneOffSnapshot>,
}

struct RunningAgent {
    process: Arc<AgentProcess>,
    conversation_id: Option<String>,
}

struct OneOffAgent {
    process: Arc<AgentProcess>,
    conversation_id: String,
    label: Option<String>,
    /// Set once a user or assistant message has been persisted.
    exchanged: Arc<AtomicBool>,
}

struct SchedulerState {
    running: HashMap<String, RunningAgent>,
    queue: VecDeque<QueueEntry>,
    one_offs: HashMap<String, OneOffAgent>,
    max_concurrent: usize,
    /// Projects whose worker is being replaced by a plan-mode worker; their
    /// slot survives the old worker's exit.
    plan_restarts: HashSet<String>,
}

impl SchedulerState {
    fn ensure_idle(&self, project_id: &str) -> Result<(), SchedulerError> {
        if self.running.contains_key(project_id) {
            return Err(SchedulerError::AlreadyRunning(project_id.to_string()));
        }
        if self.queue.iter().any(|e| e.project_id == project_id) {
            return Err(SchedulerError::AlreadyQueued(project_id.to_string()));
        }
        Ok(())
    }

    fn is_current(&self, project_id: &str, process: &Arc<AgentProcess>) -> bool {
        self.running
            .get(project_id)
            .is_some_and(|r| Arc::ptr_eq(&r.process, process))
    }

    fn at_capacity(&self) -> bool {
        self.running.len() >= self.max_concurrent
    }
}

struct LaunchParams {
    mode: AgentMode,
    instructions: String,
    session_id: Option<String>,
    is_new_session: bool,
    conversation_id: Option<String>,
    permission_mode: Option<String>,
    model: Option<String>,
}

struct Inner {
    deps: SchedulerDeps,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    serializer: WriteSerializer,
    tracker: Arc<ProcessTracker>,
    /// Forwarder and restart tasks, awaited on shutdown.
    tasks: TaskTracker,
}

/// Scheduler handle. Cheap to clone.
#[derive(Clone)]
pub struct AgentScheduler {
    inner: Arc<Inner>,
}

/// Session ids are hyphenated UUIDs.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == 36 && uuid::Uuid::try_parse(id).is_ok()
}

impl AgentScheduler {
    pub fn new(deps: SchedulerDeps, tracker: Arc<ProcessTracker>) -> Self {
        let max_concurrent = deps.settings.get().daemon.max_concurrent_agents.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(max_concurrent, "Agent scheduler created");
        Self {
            inner: Arc::new(Inner {
                deps,
                state: Mutex::new(SchedulerState {
                    running: HashMap::new(),
                    queue: VecDeque::new(),
                    one_offs: HashMap::new(),
                    max_concurrent,
                    plan_restarts: HashSet::new(),
                }),
                events,
                serializer: WriteSerializer::new(),
                tracker,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.inner.tracker
    }

    /// Start an autonomous agent, or queue it when all slots are taken.
    pub async fn start_agent(
        &self,
        project_id: &str,
        instructions: &str,
    ) -> Result<StartOutcome, SchedulerError> {
        let inner = &self.inner;
        let project = inner.find_project(project_id).await?;

        let mut state = inner.state.lock().await;
        state.ensure_idle(project_id)?;

        if state.at_capacity() {
            state.queue.push_back(QueueEntry {
                project_id: project_id.to_string(),
                instructions: instructions.to_string(),
                enqueued_at: now_millis(),
            });
            let position = state.queue.len();
            info!(project_id, position, "All agent slots busy, queued");
            inner.emit_queue_change(&state);
            return Ok(StartOutcome::Queued { position });
        }

        inner
            .launch_autonomous(&mut state, &project, instructions)
            .await?;
        Ok(StartOutcome::Started)
    }

    /// Start an interactive agent and return the session id it runs under.
    ///
    /// Never queues: fails with [`SchedulerError::CapacityReached`] when all
    /// slots are taken. An unusable session id is replaced by a fresh
    /// conversation and reported through
    /// [`SchedulerEvent::SessionRecovery`].
    pub async fn start_interactive_agent(
        &self,
        project_id: &str,
        opts: InteractiveOptions,
    ) -> Result<String, SchedulerError> {
        let inner = &self.inner;
        let project = inner.find_project(project_id).await?;

        let mut state = inner.state.lock().await;
        state.ensure_idle(project_id)?;
        if state.at_capacity() {
            warn!(project_id, max = state.max_concurrent, "Interactive start rejected at capacity");
            return Err(SchedulerError::CapacityReached {
                max: state.max_concurrent,
            });
        }

        let (session_id, is_new_session) = inner
            .resolve_session(&project, opts.session_id.as_deref())
            .await?;
        let params = LaunchParams {
            mode: AgentMode::Interactive,
            instructions: opts.message.unwrap_or_default(),
            session_id: Some(session_id.clone()),
            is_new_session,
            conversation_id: Some(session_id.clone()),
            permission_mode: opts.permission_mode,
            model: opts.model,
        };
        inner.launch(&mut state, &project, params).await?;
        Ok(session_id)
    }

    /// Stop a running agent, or drop it from the queue if it has not started.
    pub async fn stop_agent(&self, project_id: &str) -> Result<(), SchedulerError> {
        let process = {
            let mut state = self.inner.state.lock().await;
            if let Some(pos) = state.queue.iter().position(|e| e.project_id == project_id) {
                state.queue.remove(pos);
                info!(project_id, "Removed agent from queue");
                self.inner.emit_queue_change(&state);
                return Ok(());
            }
            state.plan_restarts.remove(project_id);
            state
                .running
                .get(project_id)
                .map(|r| Arc::clone(&r.process))
                .ok_or_else(|| SchedulerError::NotRunning(project_id.to_string()))?
        };
        process.stop().await;
        Ok(())
    }

    /// Cancel a queued start. Returns `false` when the project is not queued.
    pub async fn remove_from_queue(&self, project_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(pos) = state.queue.iter().position(|e| e.project_id == project_id) else {
            return false;
        };
        state.queue.remove(pos);
        self.inner.emit_queue_change(&state);
        true
    }

    pub async fn send_input(
        &self,
        project_id: &str,
        text: &str,
        images: &[ImageAttachment],
    ) -> Result<InputDisposition, SchedulerError> {
        let process = self.running_process(project_id).await?;
        if process.mode() != AgentMode::Interactive {
            return Err(SchedulerError::NotInteractive(project_id.to_string()));
        }
        process
            .send_input(text, images)
            .map_err(|e| SchedulerError::from_process(project_id, e))
    }

    pub async fn remove_queued_message(
        &self,
        project_id: &str,
        index: usize,
    ) -> Result<bool, SchedulerError> {
        Ok(self
            .running_process(project_id)
            .await?
            .remove_queued_message(index))
    }

    pub async fn set_max_concurrent_agents(&self, max: usize) {
        let mut state = self.inner.state.lock().await;
        state.max_concurrent = max.max(1);
        info!(max_concurrent = state.max_concurrent, "Concurrency limit changed");
        self.inner.drain_queue(&mut state).await;
    }

    pub async fn max_concurrent_agents(&self) -> usize {
        self.inner.state.lock().await.max_concurrent
    }

    /// Start an ephemeral agent addressed by the returned handle. One-off
    /// agents bypass the queue and do not count against the limit.
    pub async fn start_one_off_agent(
        &self,
        request: OneOffRequest,
    ) -> Result<String, SchedulerError> {
        let inner = &self.inner;
        let project = inner.find_project(&request.project_id).await?;
        let conversation = inner
            .deps
            .conversations
            .create(&project.id, request.label.as_deref())
            .await?;
        let handle = format!("{ONE_OFF_PREFIX}{}", uuid::Uuid::new_v4());

        let settings = inner.deps.settings.get();
        let mut config = AgentConfig::new(&project.id, &project.path, AgentMode::Interactive)
            .with_settings(&settings);
        config.permissions = inner
            .deps
            .permissions
            .generate_args(&settings, &PermissionOverrides::default());
        config.session_id = Some(conversation.id.clone());
        config.is_new_session = true;

        let (process, rx) = AgentProcess::new(config);
        let process = Arc::new(process);
        if let Err(e) = process.start(&request.message) {
            if let Err(del) = inner
                .deps
                .conversations
                .delete_conversation(&conversation.id)
                .await
            {
                debug!(error = %del, "Failed to delete conversation of failed one-off");
            }
            return Err(SchedulerError::from_process(&handle, e));
        }
        if let Some(pid) = process.pid() {
            inner.tracker.track_process(&handle, pid);
        }

        let exchanged = Arc::new(AtomicBool::new(false));
        inner.state.lock().await.one_offs.insert(
            handle.clone(),
            OneOffAgent {
                process,
                conversation_id: conversation.id.clone(),
                label: request.label,
                exchanged: Arc::clone(&exchanged),
            },
        );
        inner.tasks.spawn(Arc::clone(inner).forward_one_off(
            handle.clone(),
            project.id,
            rx,
            conversation.id,
            exchanged,
        ));
        info!(handle = %handle, project_id = %request.project_id, "One-off agent started");
        Ok(handle)
    }

    pub async fn stop_one_off_agent(&self, handle: &str) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let agent = inner
            .state
            .lock()
            .await
            .one_offs
            .remove(handle)
            .ok_or_else(|| SchedulerError::OneOffNotFound(handle.to_string()))?;
        agent.process.stop().await;
        inner.tracker.untrack_process(handle);
        let _ = inner.discard_unused_one_off(handle, &agent).await;
        info!(handle, "One-off agent stopped");
        Ok(())
    }

    pub async fn send_one_off_input(
        &self,
        handle: &str,
        text: &str,
        images: &[ImageAttachment],
    ) -> Result<InputDisposition, SchedulerError> {
        self.one_off_process(handle)
            .await?
            .send_input(text, images)
            .map_err(|e| SchedulerError::from_process(handle, e))
    }

    pub async fn get_one_off_status(&self, handle: &str) -> Result<AgentStatus, SchedulerError> {
        Ok(self.one_off_process(handle).await?.status())
    }

    pub async fn get_one_off_context_usage(
        &self,
        handle: &str,
    ) -> Result<ContextUsage, SchedulerError> {
        Ok(self.one_off_process(handle).await?.context_usage())
    }

    /// Stop everything and drain persistence.
    ///
    /// Workers stop in parallel. Once their forwarders have drained, unused
    /// one-off conversations are dropped, then the write serializer and the
    /// conversation store are flushed.
    pub async fn stop_all_agents(&self) {
        let inner = &self.inner;
        let (processes, one_offs) = {
            let mut state = inner.state.lock().await;
            state.plan_restarts.clear();
            if !state.queue.is_empty() {
                state.queue.clear();
                inner.emit_queue_change(&state);
            }
            let mut all: Vec<_> = state
                .running
                .values()
                .map(|r| Arc::clone(&r.process))
                .collect();
            let one_offs: Vec<(String, OneOffAgent)> = state.one_offs.drain().collect();
            all.extend(one_offs.iter().map(|(_, agent)| Arc::clone(&agent.process)));
            (all, one_offs)
        };
        info!(count = processes.len(), "Stopping all agents");

        let mut stops = JoinSet::new();
        for process in processes {
            stops.spawn(async move { process.stop().await });
        }
        while stops.join_next().await.is_some() {}

        inner.tasks.close();
        inner.tasks.wait().await;
        inner.tasks.reopen();

        for (handle, agent) in &one_offs {
            inner.tracker.untrack_process(handle);
            drop(inner.discard_unused_one_off(handle, agent));
        }

        inner.serializer.flush().await;
        if let Err(e) = inner.deps.conversations.flush().await {
            error!(error = %e, "Failed to flush conversations");
        }
        info!("All agents stopped");
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.inner.state.lock().await;
        let mut running: Vec<WorkerSnapshot> =
            state.running.values().map(|r| r.process.snapshot()).collect();
        running.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        let mut one_offs: Vec<OneOffSnapshot> = state
            .one_offs
            .iter()
            .map(|(handle, agent)| OneOffSnapshot {
                handle: handle.clone(),
                label: agent.label.clone(),
                conversation_id: agent.conversation_id.clone(),
                worker: agent.process.snapshot(),
            })
            .collect();
        one_offs.sort_by(|a, b| a.handle.cmp(&b.handle));
        SchedulerSnapshot {
            max_concurrent_agents: state.max_concurrent,
            running,
            queue: state.queue.iter().cloned().collect(),
            one_offs,
        }
    }

    pub async fn queue(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn is_queued(&self, project_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .queue
            .iter()
            .any(|e| e.project_id == project_id)
    }

    pub async fn running_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().await.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn agent_status(&self, project_id: &str) -> AgentStatus {
        self.inner
            .state
            .lock()
            .await
            .running
            .get(project_id)
            .map_or(AgentStatus::Stopped, |r| r.process.status())
    }

    pub async fn context_usage(&self, project_id: &str) -> Option<ContextUsage> {
        self.inner
            .state
            .lock()
            .await
            .running
            .get(project_id)
            .map(|r| r.process.context_usage())
    }

    async fn running_process(&self, project_id: &str) -> Result<Arc<AgentProcess>, SchedulerError> {
        self.inner
            .state
            .lock()
            .await
            .running
            .get(project_id)
            .map(|r| Arc::clone(&r.process))
            .ok_or_else(|| SchedulerError::NotRunning(project_id.to_string()))
    }

    async fn one_off_process(&self, handle: &str) -> Result<Arc<AgentProcess>, SchedulerError> {
        self.inner
            .state
            .lock()
            .await
            .one_offs
            .get(handle)
            .map(|a| Arc::clone(&a.process))
            .ok_or_else(|| SchedulerError::OneOffNotFound(handle.to_string()))
    }
}

impl Inner {
    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_queue_change(&self, state: &SchedulerState) {
        self.emit(SchedulerEvent::QueueChange {
            entries: state.queue.iter().cloned().collect(),
        });
    }

    async fn find_project(&self, project_id: &str) -> Result<Project, SchedulerError> {
        self.deps
            .projects
            .find_by_id(project_id)
            .await?
            .ok_or_else(|| SchedulerError::ProjectNotFound(project_id.to_string()))
    }

    /// Pick the session for an interactive start: requested id, then the
    /// project's current conversation, then a fresh one. Returns the id and
    /// whether the worker should create (rather than resume) it.
    async fn resolve_session(
        &self,
        project: &Project,
        requested: Option<&str>,
    ) -> Result<(String, bool), SchedulerError> {
        let candidate = requested
            .map(String::from)
            .or_else(|| project.current_conversation_id.clone());

        let Some(candidate) = candidate else {
            let conversation = self.deps.conversations.create(&project.id, None).await?;
            self.deps
                .projects
                .set_current_conversation(&project.id, &conversation.id)
                .await?;
            return Ok((conversation.id, true));
        };

        if !is_valid_session_id(&candidate) {
            let new_id = self
                .recover_session(&project.id, &candidate, "Invalid session id")
                .await?;
            return Ok((new_id, true));
        }

        match self.deps.conversations.find_by_id(&candidate).await? {
            Some(conversation) => {
                if project.current_conversation_id.as_deref() != Some(conversation.id.as_str()) {
                    self.deps
                        .projects
                        .set_current_conversation(&project.id, &conversation.id)
                        .await?;
                }
                Ok((conversation.id, conversation.message_count == 0))
            }
            None => {
                let new_id = self
                    .recover_session(&project.id, &candidate, "Conversation not found")
                    .await?;
                Ok((new_id, true))
            }
        }
    }

    /// Replace an unusable session with a fresh conversation.
    async fn recover_session(
        &self,
        project_id: &str,
        bad_id: &str,
        reason: &str,
    ) -> Result<String, SchedulerError> {
        let conversation = self
            .deps
            .conversations
            .create(project_id, Some("Recovered session"))
            .await?;
        self.deps
            .projects
            .set_current_conversation(project_id, &conversation.id)
            .await?;
        warn!(
            project_id,
            old_session_id = bad_id,
            new_session_id = %conversation.id,
            reason,
            "Session recovered with a new conversation"
        );
        self.emit(SchedulerEvent::SessionRecovery {
            project_id: project_id.to_string(),
            old_session_id: bad_id.to_string(),
            new_session_id: conversation.id.clone(),
            reason: reason.to_string(),
        });
        Ok(conversation.id)
    }

    async fn launch_autonomous(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        project: &Project,
        instructions: &str,
    ) -> Result<Arc<AgentProcess>, SchedulerError> {
        let conversation = self
            .deps
            .conversations
            .create(&project.id, Some("Autonomous run"))
            .await?;
        self.deps
            .projects
            .set_current_conversation(&project.id, &conversation.id)
            .await?;
        let params = LaunchParams {
            mode: AgentMode::Autonomous,
            instructions: self.deps.instructions.generate(project, instructions),
            session_id: Some(conversation.id.clone()),
            is_new_session: true,
            conversation_id: Some(conversation.id),
            permission_mode: None,
            model: None,
        };
        self.launch(state, project, params).await
    }

    /// Spawn a worker into a slot. The caller holds the state lock and has
    /// already checked capacity.
    async fn launch(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        project: &Project,
        params: LaunchParams,
    ) -> Result<Arc<AgentProcess>, SchedulerError> {
        let settings = self.deps.settings.get();
        let mut config =
            AgentConfig::new(&project.id, &project.path, params.mode).with_settings(&settings);
        config.permissions = self.deps.permissions.generate_args(
            &settings,
            &PermissionOverrides {
                permission_mode: params.permission_mode,
                skip_permissions: None,
            },
        );
        config.session_id = params.session_id;
        config.is_new_session = params.is_new_session;
        if params.model.is_some() {
            config.model = params.model;
        }

        let (process, mut rx) = AgentProcess::new(config);
        let process = Arc::new(process);
        if let Err(e) = process.start(&params.instructions) {
            // Surface the failure messages the supervisor already produced.
            while let Ok(event) = rx.try_recv() {
                if let AgentEvent::Message(message) = event {
                    self.emit(SchedulerEvent::Message {
                        project_id: project.id.clone(),
                        message,
                    });
                }
            }
            self.emit(SchedulerEvent::Status {
                project_id: project.id.clone(),
                status: AgentStatus::Error,
            });
            self.persist_status(&project.id, AgentStatus::Error);
            return Err(SchedulerError::from_process(&project.id, e));
        }

        if let Some(pid) = process.pid() {
            self.tracker.track_process(&project.id, pid);
        }
        state.running.insert(
            project.id.clone(),
            RunningAgent {
                process: Arc::clone(&process),
                conversation_id: params.conversation_id.clone(),
            },
        );
        self.persist_status(&project.id, AgentStatus::Running);
        self.tasks.spawn(Arc::clone(self).forward_events(
            project.id.clone(),
            Arc::clone(&process),
            rx,
            params.conversation_id,
        ));
        info!(
            project_id = %project.id,
            mode = ?params.mode,
            running = state.running.len(),
            max = state.max_concurrent,
            "Agent started"
        );
        Ok(process)
    }

    /// Start queued agents while slots are free.
    async fn drain_queue(self: &Arc<Self>, state: &mut SchedulerState) {
        let mut changed = false;
        while !state.at_capacity() {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            changed = true;
            let project = match self.deps.projects.find_by_id(&entry.project_id).await {
                Ok(Some(project)) => project,
                Ok(None) => {
                    warn!(project_id = %entry.project_id, "Dropping queued agent for unknown project");
                    continue;
                }
                Err(e) => {
                    warn!(project_id = %entry.project_id, error = %e, "Dropping queued agent");
                    continue;
                }
            };
            info!(
                project_id = %entry.project_id,
                waited_ms = now_millis().saturating_sub(entry.enqueued_at),
                "Starting queued agent"
            );
            if let Err(e) = self
                .launch_autonomous(state, &project, &entry.instructions)
                .await
            {
                error!(project_id = %entry.project_id, error = %e, "Failed to start queued agent");
            }
        }
        if changed {
            self.emit_queue_change(state);
        }
    }

    /// Relay one worker's events until it exits. Boxed because it is spawned
    /// from [`launch`](Self::launch), which it can reach again via the queue.
    fn forward_events(
        self: Arc<Self>,
        project_id: String,
        process: Arc<AgentProcess>,
        mut rx: mpsc::UnboundedReceiver<AgentEvent>,
        mut conversation_id: Option<String>,
    ) -> BoxFuture {
        Box::pin(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::Message(message) => {
                        if let Some(ref conversation_id) = conversation_id {
                            self.persist_message(&project_id, conversation_id, &message);
                        }
                        self.emit(SchedulerEvent::Message {
                            project_id: project_id.clone(),
                            message,
                        });
                    }
                    AgentEvent::Status(status) => self.emit(SchedulerEvent::Status {
                        project_id: project_id.clone(),
                        status,
                    }),
                    AgentEvent::SessionId(session_id) => {
                        debug!(%project_id, %session_id, "Worker session id");
                    }
                    AgentEvent::WaitingForInput {
                        is_waiting,
                        version,
                    } => self.emit(SchedulerEvent::WaitingForInput {
                        project_id: project_id.clone(),
                        is_waiting,
                        version,
                    }),
                    AgentEvent::ContextUsage(usage) => {
                        debug!(%project_id, total = usage.total_tokens, percent = usage.percent_used, "Context usage");
                    }
                    AgentEvent::EnterPlanMode => {
                        self.tasks.spawn(
                            Arc::clone(&self)
                                .restart_in_plan_mode(project_id.clone(), Arc::clone(&process)),
                        );
                    }
                    AgentEvent::ExitPlanMode { plan } => self.emit(SchedulerEvent::ExitPlanMode {
                        project_id: project_id.clone(),
                        plan,
                    }),
                    AgentEvent::SessionNotFound(bad_id) => {
                        self.emit(SchedulerEvent::SessionNotFound {
                            project_id: project_id.clone(),
                            session_id: bad_id.clone(),
                        });
                        match self
                            .recover_session(&project_id, &bad_id, "Session not found by worker")
                            .await
                        {
                            Ok(new_id) => {
                                let mut state = self.state.lock().await;
                                if let Some(running) = state.running.get_mut(&project_id)
                                    && Arc::ptr_eq(&running.process, &process)
                                {
                                    running.conversation_id = Some(new_id.clone());
                                }
                                conversation_id = Some(new_id);
                            }
                            Err(e) => warn!(%project_id, error = %e, "Session recovery failed"),
                        }
                    }
                    AgentEvent::Error(message) => {
                        warn!(%project_id, error = %message, "Agent reported an error");
                    }
                    AgentEvent::Exit { code } => {
                        self.on_agent_exit(&project_id, &process, code).await;
                        break;
                    }
                }
            }
        })
    }

    async fn on_agent_exit(
        self: &Arc<Self>,
        project_id: &str,
        process: &Arc<AgentProcess>,
        code: Option<i32>,
    ) {
        let mut state = self.state.lock().await;
        self.emit(SchedulerEvent::Exit {
            project_id: project_id.to_string(),
            code,
        });
        if !state.is_current(project_id, process) {
            debug!(project_id, "Exited worker no longer owns the slot");
            return;
        }
        if state.plan_restarts.contains(project_id) {
            debug!(project_id, "Worker exited for plan-mode restart");
            return;
        }

        state.running.remove(project_id);
        self.tracker.untrack_process(project_id);
        let status = process.status();
        self.persist_final(project_id, status, process.context_usage());
        info!(project_id, ?code, ?status, "Agent slot released");
        self.drain_queue(&mut state).await;
    }

    /// Replace the worker with one in plan mode, continuing the same session.
    async fn restart_in_plan_mode(self: Arc<Self>, project_id: String, process: Arc<AgentProcess>) {
        {
            let mut state = self.state.lock().await;
            if !state.is_current(&project_id, &process) {
                return;
            }
            if !state.plan_restarts.insert(project_id.clone()) {
                debug!(%project_id, "Plan-mode restart already pending");
                return;
            }
        }
        info!(%project_id, "Restarting agent in plan mode");
        process.stop().await;

        let mut state = self.state.lock().await;
        let requested = state.plan_restarts.remove(&project_id);
        if !state.is_current(&project_id, &process) {
            return;
        }
        let Some(previous) = state.running.remove(&project_id) else {
            return;
        };
        self.tracker.untrack_process(&project_id);

        if !requested {
            // Cancelled by an explicit stop while the old worker was exiting.
            self.persist_final(&project_id, process.status(), process.context_usage());
            self.drain_queue(&mut state).await;
            return;
        }

        let project = match self.deps.projects.find_by_id(&project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(%project_id, "Project vanished before plan-mode restart");
                self.drain_queue(&mut state).await;
                return;
            }
            Err(e) => {
                warn!(%project_id, error = %e, "Plan-mode restart aborted");
                self.persist_status(&project_id, AgentStatus::Error);
                self.drain_queue(&mut state).await;
                return;
            }
        };

        let session_id = process
            .session_id()
            .or_else(|| previous.conversation_id.clone());
        let params = LaunchParams {
            mode: process.mode(),
            instructions: CONTINUE_INSTRUCTION.to_string(),
            is_new_session: false,
            session_id,
            conversation_id: previous.conversation_id,
            permission_mode: Some(PLAN_MODE.to_string()),
            model: process.snapshot().model,
        };
        if let Err(e) = self.launch(&mut state, &project, params).await {
            error!(%project_id, error = %e, "Plan-mode restart failed");
            self.drain_queue(&mut state).await;
        }
    }

    async fn forward_one_off(
        self: Arc<Self>,
        handle: String,
        project_id: String,
        mut rx: mpsc::UnboundedReceiver<AgentEvent>,
        conversation_id: String,
        exchanged: Arc<AtomicBool>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Message(message) => {
                    self.persist_message(&handle, &conversation_id, &message);
                    if matches!(message.kind, MessageKind::User | MessageKind::Stdout) {
                        exchanged.store(true, Ordering::SeqCst);
                    }
                    self.emit(SchedulerEvent::OneOffMessage {
                        handle: handle.clone(),
                        project_id: project_id.clone(),
                        message,
                    });
                }
                AgentEvent::Status(status) => self.emit(SchedulerEvent::OneOffStatus {
                    handle: handle.clone(),
                    status,
                }),
                AgentEvent::Exit { code } => {
                    self.tracker.untrack_process(&handle);
                    info!(%handle, ?code, "One-off agent exited");
                    self.emit(SchedulerEvent::OneOffExit { handle, code });
                    break;
                }
                other => debug!(%handle, event = ?other, "One-off agent event"),
            }
        }
    }

    /// Delete a stopped one-off's conversation unless a user or assistant
    /// message reached it. Chained behind the handle's pending writes.
    fn discard_unused_one_off(&self, handle: &str, agent: &OneOffAgent) -> JoinHandle<()> {
        let conversations = Arc::clone(&self.deps.conversations);
        let conversation_id = agent.conversation_id.clone();
        let exchanged = Arc::clone(&agent.exchanged);
        self.serializer.with_lock(handle, async move {
            if exchanged.load(Ordering::SeqCst) {
                return;
            }
            debug!(%conversation_id, "Deleting unused one-off conversation");
            if let Err(e) = conversations.delete_conversation(&conversation_id).await {
                warn!(%conversation_id, error = %e, "Failed to delete unused conversation");
            }
        })
    }

    fn persist_message(&self, key: &str, conversation_id: &str, message: &DomainMessage) {
        let store = Arc::clone(&self.deps.conversations);
        let conversation_id = conversation_id.to_string();
        let message = message.clone();
        drop(self.serializer.with_lock(key, async move {
            if let Err(e) = store.add_message(&conversation_id, &message).await {
                warn!(%conversation_id, error = %e, "Failed to persist message");
            }
        }));
    }

    fn persist_status(&self, project_id: &str, status: AgentStatus) {
        let projects = Arc::clone(&self.deps.projects);
        let id = project_id.to_string();
        drop(self.serializer.with_lock(project_id, async move {
            if let Err(e) = projects.update_status(&id, status).await {
                warn!(project_id = %id, error = %e, "Failed to persist agent status");
            }
        }));
    }

    fn persist_final(&self, project_id: &str, status: AgentStatus, usage: ContextUsage) {
        let projects = Arc::clone(&self.deps.projects);
        let id = project_id.to_string();
        drop(self.serializer.with_lock(project_id, async move {
            if let Err(e) = projects.update_context_usage(&id, &usage).await {
                warn!(project_id = %id, error = %e, "Failed to persist context usage");
            }
            if let Err(e) = projects.update_status(&id, status).await {
                warn!(project_id = %id, error = %e, "Failed to persist agent status");
            }
        }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{
        ConfigSettings, DefaultInstructions, DefaultPermissionArgs, MemoryConversationStore,
        MemoryProjectStore,
    };
    use flock_core::config::Config;

    fn scheduler(max: usize) -> (AgentScheduler, MemoryProjectStore) {
        let projects = MemoryProjectStore::new();
        let mut config = Config::default();
        config.daemon.max_concurrent_agents = max;
        let deps = SchedulerDeps {
            projects: Arc::new(projects.clone()),
            conversations: Arc::new(MemoryConversationStore::new()),
            settings: Arc::new(ConfigSettings::new(config)),
            permissions: Arc::new(DefaultPermissionArgs),
            instructions: Arc::new(DefaultInstructions),
        };
        (
            AgentScheduler::new(deps, Arc::new(ProcessTracker::default())),
            projects,
        )
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("6f1c2b9e-3f5a-4a43-9d8e-2b7c1f0a9e11"));
        assert!(!is_valid_session_id("6f1c2b9e3f5a4a439d8e2b7c1f0a9e11"));
        assert!(!is_valid_session_id("not-a-session"));
        assert!(!is_valid_session_id(""));
    }

    #[test]
    fn process_errors_map_to_call_boundary_errors() {
        assert!(matches!(
            SchedulerError::from_process("p", ProcessError::StdinUnavailable),
            SchedulerError::StdinUnavailable(ref p) if p == "p"
        ));
        assert!(matches!(
            SchedulerError::from_process("p", ProcessError::NotRunning),
            SchedulerError::NotRunning(_)
        ));
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SchedulerEvent::SessionRecovery {
            project_id: "p".into(),
            old_session_id: "bad".into(),
            new_session_id: "new".into(),
            reason: "Invalid session id".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session_recovery");
        assert_eq!(json["old_session_id"], "bad");
    }

    #[tokio::test]
    async fn unknown_project_is_rejected() {
        let (scheduler, _) = scheduler(2);
        assert!(matches!(
            scheduler.start_agent("nope", "do things").await,
            Err(SchedulerError::ProjectNotFound(_))
        ));
        assert!(matches!(
            scheduler
                .start_interactive_agent("nope", InteractiveOptions::default())
                .await,
            Err(SchedulerError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn max_concurrent_is_clamped_to_one() {
        let (scheduler, _) = scheduler(0);
        assert_eq!(scheduler.max_concurrent_agents().await, 1);
        scheduler.set_max_concurrent_agents(0).await;
        assert_eq!(scheduler.max_concurrent_agents().await, 1);
        scheduler.set_max_concurrent_agents(4).await;
        assert_eq!(scheduler.max_concurrent_agents().await, 4);
    }

    #[tokio::test]
    async fn calls_on_idle_projects_fail_cleanly() {
        let (scheduler, projects) = scheduler(1);
        projects.insert(Project::new("p1", "demo", "/tmp")).await;

        assert!(matches!(
            scheduler.send_input("p1", "hi", &[]).await,
            Err(SchedulerError::NotRunning(_))
        ));
        assert!(matches!(
            scheduler.stop_agent("p1").await,
            Err(SchedulerError::NotRunning(_))
        ));
        assert!(!scheduler.remove_from_queue("p1").await);
        assert!(matches!(
            scheduler.get_one_off_status("oneoff-missing").await,
            Err(SchedulerError::OneOffNotFound(_))
        ));
        assert_eq!(scheduler.agent_status("p1").await, AgentStatus::Stopped);
        assert!(scheduler.context_usage("p1").await.is_none());
    }

    #[tokio::test]
    async fn stop_all_with_nothing_running_returns() {
        let (scheduler, _) = scheduler(1);
        tokio::time::timeout(std::time::Duration::from_secs(2), scheduler.stop_all_agents())
            .await
            .expect("stop_all_agents completes");
        let snapshot = scheduler.snapshot().await;
        assert!(snapshot.running.is_empty());
        assert!(snapshot.queue.is_empty());
    }
}
