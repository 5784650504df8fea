#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Scheduler integration tests against a scripted stand-in for the CLI.
//!
//! The fake worker reads stream-json envelopes from stdin, answers each with
//! one assistant message and a result, and then lingers or exits depending
//! on the test. It appends its argv to `<bin>.argv` and every stdin line to
//! `<bin>.stdin`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::broadcast;

use flock_core::config::Config;
use flock_core::ndjson::MessageKind;
use flock_daemon::orchestration::{
    AgentScheduler, InteractiveOptions, OneOffRequest, ProcessTracker, SchedulerDeps,
    SchedulerError, SchedulerEvent, StartOutcome,
};
use flock_daemon::store::{
    ConfigSettings, ConversationStore, DefaultInstructions, DefaultPermissionArgs,
    MemoryConversationStore, MemoryProjectStore, Project, ProjectStore,
};
use flock_daemon::subprocess::{AgentStatus, InputDisposition};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the fake worker does once stdin closes.
const LINGER: &str = "exec sleep 30";

/// One successful turn.
const REPLY: &str = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'
  echo '{"type":"result","subtype":"success","is_error":false,"result":"done"}'"#;

/// Script fragments spliced into the fake worker. `reply` runs once per
/// stdin line and may read `$session`, `$mode` and `$turn`.
struct FakeWorker<'a> {
    prelude: &'a str,
    turn_delay: &'a str,
    reply: &'a str,
    after_stdin: &'a str,
}

impl Default for FakeWorker<'_> {
    fn default() -> Self {
        Self {
            prelude: "",
            turn_delay: "0",
            reply: REPLY,
            after_stdin: LINGER,
        }
    }
}

impl FakeWorker<'_> {
    fn script(&self) -> String {
        let Self {
            prelude,
            turn_delay,
            reply,
            after_stdin,
        } = self;
        format!(
            r#"#!/bin/sh
{prelude}
printf '%s\n' "$*" >> "$0.argv"
session=""
mode=""
while [ $# -gt 0 ]; do
  case "$1" in
    --session-id|--resume) session="$2"; shift ;;
    --permission-mode) mode="$2"; shift ;;
  esac
  shift
done
echo "{{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"$session\",\"model\":\"fake-model\"}}"
turn=0
while IFS= read -r line; do
  turn=$((turn + 1))
  printf '%s\n' "$line" >> "$0.stdin"
  sleep {turn_delay}
  {reply}
done
{after_stdin}
"#
        )
    }
}

fn fake_worker_script(turn_delay: &str, after_stdin: &str) -> String {
    FakeWorker {
        turn_delay,
        after_stdin,
        ..FakeWorker::default()
    }
    .script()
}

fn log_lines(bin: &Path, suffix: &str) -> Vec<String> {
    let mut path = bin.as_os_str().to_owned();
    path.push(suffix);
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

struct Harness {
    scheduler: AgentScheduler,
    projects: MemoryProjectStore,
    conversations: MemoryConversationStore,
    tracker: Arc<ProcessTracker>,
    bin: PathBuf,
    _dir: TempDir,
}

async fn harness(max_agents: usize, script: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bin: PathBuf = dir.path().join("fake-claude");
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = Config::default();
    config.daemon.max_concurrent_agents = max_agents;
    config.daemon.claude_bin = bin.clone();
    config.daemon.terminate_timeout_secs = 2;

    let projects = MemoryProjectStore::new();
    for id in ["p1", "p2", "p3"] {
        projects.insert(Project::new(id, id, dir.path())).await;
    }
    let conversations = MemoryConversationStore::new();
    let tracker = Arc::new(ProcessTracker::new(Duration::from_millis(100)));
    let scheduler = AgentScheduler::new(
        SchedulerDeps {
            projects: Arc::new(projects.clone()),
            conversations: Arc::new(conversations.clone()),
            settings: Arc::new(ConfigSettings::new(config)),
            permissions: Arc::new(DefaultPermissionArgs),
            instructions: Arc::new(DefaultInstructions),
        },
        Arc::clone(&tracker),
    );
    Harness {
        scheduler,
        projects,
        conversations,
        tracker,
        bin,
        _dir: dir,
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SchedulerEvent>,
    mut pred: impl FnMut(&SchedulerEvent) -> bool,
) -> SchedulerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

fn is_status(event: &SchedulerEvent, project: &str, wanted: AgentStatus) -> bool {
    matches!(event, SchedulerEvent::Status { project_id, status } if project_id == project && *status == wanted)
}

#[tokio::test]
async fn third_autonomous_start_waits_for_a_free_slot() {
    let h = harness(2, &fake_worker_script("0", LINGER)).await;
    let mut events = h.scheduler.subscribe();

    assert_eq!(
        h.scheduler.start_agent("p1", "task one").await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        h.scheduler.start_agent("p2", "task two").await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        h.scheduler.start_agent("p3", "task three").await.unwrap(),
        StartOutcome::Queued { position: 1 }
    );
    assert!(matches!(
        h.scheduler.start_agent("p3", "again").await,
        Err(SchedulerError::AlreadyQueued(_))
    ));
    assert!(matches!(
        h.scheduler.start_agent("p1", "again").await,
        Err(SchedulerError::AlreadyRunning(_))
    ));
    assert_eq!(h.scheduler.queue().await.len(), 1);
    assert!(h.tracker.tracked_pid("p1").is_some());

    h.scheduler.stop_agent("p1").await.unwrap();
    wait_for(&mut events, |e| is_status(e, "p3", AgentStatus::Running)).await;

    assert_eq!(h.scheduler.running_projects().await, vec!["p2", "p3"]);
    assert!(h.scheduler.queue().await.is_empty());
    assert!(h.tracker.tracked_pid("p1").is_none());

    h.scheduler.stop_all_agents().await;
    assert!(h.scheduler.running_projects().await.is_empty());
    assert!(h.tracker.tracked().is_empty());
}

#[tokio::test]
async fn interactive_start_at_capacity_is_rejected() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;
    h.scheduler.start_agent("p1", "task").await.unwrap();

    let err = h
        .scheduler
        .start_interactive_agent("p2", InteractiveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::CapacityReached { max: 1 }));
    assert!(h.scheduler.queue().await.is_empty());

    assert!(matches!(
        h.scheduler.send_input("p1", "hello", &[]).await,
        Err(SchedulerError::NotInteractive(_))
    ));

    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn concurrent_stops_release_the_slot_once() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;
    let mut events = h.scheduler.subscribe();
    h.scheduler.start_agent("p1", "task").await.unwrap();

    let (a, b) = tokio::join!(h.scheduler.stop_agent("p1"), h.scheduler.stop_agent("p1"));
    a.unwrap();
    b.unwrap();

    wait_for(&mut events, |e| matches!(e, SchedulerEvent::Exit { project_id, .. } if project_id == "p1")).await;
    assert_eq!(h.scheduler.agent_status("p1").await, AgentStatus::Stopped);
    assert!(h.scheduler.running_projects().await.is_empty());

    let second_exit = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let SchedulerEvent::Exit { .. } = events.recv().await.unwrap() {
                return;
            }
        }
    })
    .await;
    assert!(second_exit.is_err(), "exit must be reported once");

    // The freed slot is usable again.
    assert_eq!(
        h.scheduler.start_agent("p1", "again").await.unwrap(),
        StartOutcome::Started
    );
    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn input_during_a_turn_is_queued_and_sent_after_it() {
    let h = harness(1, &fake_worker_script("1", "exit 0")).await;
    let mut events = h.scheduler.subscribe();

    h.scheduler
        .start_interactive_agent(
            "p1",
            InteractiveOptions {
                message: Some("first".into()),
                ..InteractiveOptions::default()
            },
        )
        .await
        .unwrap();

    let disposition = h.scheduler.send_input("p1", "second", &[]).await.unwrap();
    assert_eq!(disposition, InputDisposition::Queued { position: 1 });
    assert!(h.scheduler.remove_queued_message("p1", 5).await.is_ok_and(|removed| !removed));

    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Message { project_id, message }
            if project_id == "p1" && message.kind == MessageKind::User && message.content == "second")
    })
    .await;

    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn invalid_session_id_is_replaced() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;
    let mut events = h.scheduler.subscribe();

    let session_id = h
        .scheduler
        .start_interactive_agent(
            "p1",
            InteractiveOptions {
                session_id: Some("not-a-session".into()),
                ..InteractiveOptions::default()
            },
        )
        .await
        .unwrap();
    assert_ne!(session_id, "not-a-session");

    let event = wait_for(&mut events, |e| matches!(e, SchedulerEvent::SessionRecovery { .. })).await;
    let SchedulerEvent::SessionRecovery {
        old_session_id,
        new_session_id,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(old_session_id, "not-a-session");
    assert_eq!(new_session_id, session_id);
    assert!(h.conversations.find_by_id(&session_id).await.unwrap().is_some());

    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn one_off_agents_bypass_the_limit() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;
    let mut events = h.scheduler.subscribe();
    h.scheduler.start_agent("p1", "task").await.unwrap();

    let handle = h
        .scheduler
        .start_one_off_agent(OneOffRequest {
            project_id: "p1".into(),
            message: "summarise the repo".into(),
            label: Some("summary".into()),
        })
        .await
        .unwrap();
    assert!(handle.starts_with("oneoff-"));
    assert_eq!(
        h.scheduler.get_one_off_status(&handle).await.unwrap(),
        AgentStatus::Running
    );

    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::OneOffMessage { handle: got, message, .. }
            if *got == handle && message.content == "working")
    })
    .await;

    h.scheduler.stop_one_off_agent(&handle).await.unwrap();
    assert!(matches!(
        h.scheduler.get_one_off_status(&handle).await,
        Err(SchedulerError::OneOffNotFound(_))
    ));
    assert!(h.tracker.tracked_pid(&handle).is_none());

    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn unused_one_off_conversation_is_dropped_by_stop_all() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;

    let used = h
        .scheduler
        .start_one_off_agent(OneOffRequest {
            project_id: "p1".into(),
            message: "explain the build".into(),
            label: None,
        })
        .await
        .unwrap();
    let unused = h
        .scheduler
        .start_one_off_agent(OneOffRequest {
            project_id: "p2".into(),
            message: String::new(),
            label: Some("idle".into()),
        })
        .await
        .unwrap();

    let snapshot = h.scheduler.snapshot().await;
    let conversation_of = |handle: &str| {
        snapshot
            .one_offs
            .iter()
            .find(|o| o.handle == handle)
            .unwrap()
            .conversation_id
            .clone()
    };
    let used_conversation = conversation_of(&used);
    let unused_conversation = conversation_of(&unused);

    h.scheduler.stop_all_agents().await;

    assert!(h
        .conversations
        .find_by_id(&unused_conversation)
        .await
        .unwrap()
        .is_none());
    assert!(h
        .conversations
        .find_by_id(&used_conversation)
        .await
        .unwrap()
        .is_some());
    assert!(h.tracker.tracked().is_empty());
}

#[tokio::test]
async fn enter_plan_mode_restarts_the_worker_in_plan_mode() {
    let reply = r#"if [ "$mode" = plan ]; then
    echo '{"type":"assistant","message":{"content":[{"type":"text","text":"planning"}]}}'
    echo '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
  else
    echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_plan","name":"EnterPlanMode","input":{}}]}}'
  fi"#;
    let script = FakeWorker {
        reply,
        ..FakeWorker::default()
    }
    .script();
    let h = harness(1, &script).await;
    let mut events = h.scheduler.subscribe();

    h.scheduler.start_agent("p1", "refactor the parser").await.unwrap();
    let first_pid = h.tracker.tracked_pid("p1").unwrap();

    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Exit { project_id, .. } if project_id == "p1")
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Message { project_id, message }
            if project_id == "p1" && message.content == "planning")
    })
    .await;

    // The slot stayed with p1 across the restart.
    assert_eq!(h.scheduler.running_projects().await, vec!["p1"]);
    assert_ne!(h.tracker.tracked_pid("p1"), Some(first_pid));

    let argv = log_lines(&h.bin, ".argv");
    assert_eq!(argv.len(), 2);
    assert!(argv[0].contains("--session-id"));
    assert!(!argv[0].contains("--permission-mode plan"));
    assert!(argv[1].contains("--permission-mode plan"));
    assert!(argv[1].contains("--resume"));
    let session = h
        .projects
        .find_by_id("p1")
        .await
        .unwrap()
        .unwrap()
        .current_conversation_id
        .unwrap();
    assert!(argv[1].contains(&session));

    let stdin = log_lines(&h.bin, ".stdin");
    assert_eq!(stdin.len(), 2);
    assert!(stdin[1].contains("\"Continue\""));

    h.scheduler.stop_all_agents().await;
    assert!(h.scheduler.running_projects().await.is_empty());
}

#[tokio::test]
async fn worker_ignoring_terminate_is_killed_after_the_grace_period() {
    let script = FakeWorker {
        prelude: "trap '' TERM",
        ..FakeWorker::default()
    }
    .script();
    let h = harness(1, &script).await;
    let mut events = h.scheduler.subscribe();
    h.scheduler.start_agent("p1", "task").await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Message { project_id, message }
            if project_id == "p1" && message.content == "working")
    })
    .await;

    let started = Instant::now();
    h.scheduler.stop_agent("p1").await.unwrap();
    let elapsed = started.elapsed();

    // terminate_timeout_secs is 2 in the harness.
    assert!(elapsed >= Duration::from_millis(1900), "stopped after {elapsed:?}");
    assert!(elapsed < EVENT_TIMEOUT, "stopped after {elapsed:?}");
    let exit = wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Exit { project_id, .. } if project_id == "p1")
    })
    .await;
    assert!(matches!(exit, SchedulerEvent::Exit { code: None, .. }));
    assert_eq!(h.scheduler.agent_status("p1").await, AgentStatus::Stopped);
    assert!(h.tracker.tracked_pid("p1").is_none());
}

#[tokio::test]
async fn raising_the_limit_starts_queued_agents() {
    let h = harness(1, &fake_worker_script("0", LINGER)).await;
    let mut events = h.scheduler.subscribe();

    h.scheduler.start_agent("p1", "one").await.unwrap();
    assert_eq!(
        h.scheduler.start_agent("p2", "two").await.unwrap(),
        StartOutcome::Queued { position: 1 }
    );
    assert_eq!(
        h.scheduler.start_agent("p3", "three").await.unwrap(),
        StartOutcome::Queued { position: 2 }
    );

    h.scheduler.set_max_concurrent_agents(2).await;
    wait_for(&mut events, |e| is_status(e, "p2", AgentStatus::Running)).await;

    assert_eq!(h.scheduler.max_concurrent_agents().await, 2);
    assert_eq!(h.scheduler.running_projects().await, vec!["p1", "p2"]);
    let queue = h.scheduler.queue().await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].project_id, "p3");

    h.scheduler.stop_all_agents().await;
}

#[tokio::test]
async fn session_unknown_to_the_worker_is_rebound() {
    let reply = format!(
        r#"if [ "$turn" -eq 1 ]; then
    echo "{{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"is_error\":true,\"errors\":[\"No conversation found with session ID: $session\"]}}"
  else
    {REPLY}
  fi"#
    );
    let script = FakeWorker {
        reply: &reply,
        ..FakeWorker::default()
    }
    .script();
    let h = harness(1, &script).await;
    let mut events = h.scheduler.subscribe();

    let old_session = h
        .scheduler
        .start_interactive_agent(
            "p1",
            InteractiveOptions {
                message: Some("hello".into()),
                ..InteractiveOptions::default()
            },
        )
        .await
        .unwrap();

    let not_found = wait_for(&mut events, |e| matches!(e, SchedulerEvent::SessionNotFound { .. })).await;
    assert!(matches!(not_found, SchedulerEvent::SessionNotFound { ref session_id, .. } if *session_id == old_session));
    let recovery = wait_for(&mut events, |e| matches!(e, SchedulerEvent::SessionRecovery { .. })).await;
    let SchedulerEvent::SessionRecovery {
        old_session_id,
        new_session_id,
        ..
    } = recovery
    else {
        unreachable!()
    };
    assert_eq!(old_session_id, old_session);
    assert_ne!(new_session_id, old_session);

    let project = h.projects.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(project.current_conversation_id.as_deref(), Some(new_session_id.as_str()));

    // Later messages land in the replacement conversation.
    h.scheduler.send_input("p1", "again", &[]).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Message { project_id, message }
            if project_id == "p1" && message.content == "working")
    })
    .await;
    h.scheduler.stop_all_agents().await;

    let messages = h.conversations.messages(&new_session_id).await;
    assert!(messages
        .iter()
        .any(|m| m.kind == MessageKind::User && m.content == "again"));
    assert!(!h
        .conversations
        .messages(&old_session)
        .await
        .iter()
        .any(|m| m.content == "again"));
}

#[tokio::test]
async fn non_zero_exit_marks_the_agent_as_failed() {
    let h = harness(1, &fake_worker_script("0", "exit 3")).await;
    let mut events = h.scheduler.subscribe();

    h.scheduler.start_agent("p1", "task").await.unwrap();
    wait_for(&mut events, |e| is_status(e, "p1", AgentStatus::Error)).await;
    let exit = wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::Exit { project_id, .. } if project_id == "p1")
    })
    .await;
    assert!(matches!(exit, SchedulerEvent::Exit { code: Some(3), .. }));

    h.scheduler.stop_all_agents().await;
    assert!(h.scheduler.running_projects().await.is_empty());
    let project = h.projects.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(project.status, AgentStatus::Error);
}
