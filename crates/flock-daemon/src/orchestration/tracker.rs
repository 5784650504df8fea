//! Pid bookkeeping for orphan cleanup.
//!
//! The tracker records which pid runs for which project independently of
//! any [`AgentProcess`](crate::subprocess::AgentProcess) object. With a state
//! file configured, the table survives a daemon crash and
//! [`ProcessTracker::cleanup_orphan_processes`] can reap leftovers on the
//! next start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::subprocess::{KillError, KillSignal, is_process_alive, signal_process};

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub killed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub killed_pids: Vec<u32>,
    pub failed_pids: Vec<u32>,
    pub skipped_pids: Vec<u32>,
}

#[derive(Debug)]
pub struct ProcessTracker {
    pids: Mutex<HashMap<String, u32>>,
    state_path: Option<PathBuf>,
    recheck_delay: Duration,
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ProcessTracker {
    /// In-memory tracker.
    pub fn new(recheck_delay: Duration) -> Self {
        Self {
            pids: Mutex::new(HashMap::new()),
            state_path: None,
            recheck_delay,
        }
    }

    /// Tracker persisted to `path`, preloaded with whatever the file holds.
    pub fn with_state_file(path: impl Into<PathBuf>, recheck_delay: Duration) -> flock_core::Result<Self> {
        let path = path.into();
        let pids = load_state(&path)?;
        if !pids.is_empty() {
            info!(path = %path.display(), count = pids.len(), "Loaded tracked pids");
        }
        Ok(Self {
            pids: Mutex::new(pids),
            state_path: Some(path),
            recheck_delay,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_process(&self, project_id: &str, pid: u32) {
        debug!(project_id, pid, "Tracking process");
        let mut pids = self.lock();
        pids.insert(project_id.to_string(), pid);
        self.persist(&pids);
    }

    pub fn untrack_process(&self, project_id: &str) -> Option<u32> {
        let mut pids = self.lock();
        let removed = pids.remove(project_id);
        if removed.is_some() {
            debug!(project_id, pid = ?removed, "Untracked process");
            self.persist(&pids);
        }
        removed
    }

    pub fn tracked_pid(&self, project_id: &str) -> Option<u32> {
        self.lock().get(project_id).copied()
    }

    pub fn tracked(&self) -> HashMap<String, u32> {
        self.lock().clone()
    }

    /// Terminate every tracked pid that is still alive.
    ///
    /// Dead pids are `skipped`; live ones get a terminate signal and, after
    /// the recheck delay, count as `killed` when gone or `failed` otherwise.
    /// Only failed entries stay tracked.
    pub async fn cleanup_orphan_processes(&self) -> CleanupReport {
        let entries = self.tracked();
        let mut report = CleanupReport::default();
        let mut signalled = Vec::new();

        for (project_id, pid) in entries {
            if !is_process_alive(pid) {
                report.skipped_pids.push(pid);
                self.untrack_process(&project_id);
                continue;
            }
            let result = signal_process(pid, KillSignal::Terminate);
            if self.record_signal(&project_id, pid, result, &mut report) {
                signalled.push((project_id, pid));
            }
        }

        if !signalled.is_empty() {
            tokio::time::sleep(self.recheck_delay).await;
        }
        for (project_id, pid) in signalled {
            if is_process_alive(pid) {
                warn!(project_id, pid, "Orphan survived terminate signal");
                report.failed_pids.push(pid);
            } else {
                report.killed_pids.push(pid);
                self.untrack_process(&project_id);
            }
        }

        report.killed = report.killed_pids.len();
        report.failed = report.failed_pids.len();
        report.skipped = report.skipped_pids.len();
        info!(
            killed = report.killed,
            failed = report.failed,
            skipped = report.skipped,
            "Orphan cleanup finished"
        );
        report
    }

    /// Sort the outcome of a terminate signal into the report. Returns
    /// whether the pid was signalled and needs a re-check.
    fn record_signal(
        &self,
        project_id: &str,
        pid: u32,
        result: Result<(), KillError>,
        report: &mut CleanupReport,
    ) -> bool {
        match result {
            Ok(()) => true,
            // Exited between the liveness check and the signal.
            Err(KillError::NoSuchProcess(_)) => {
                debug!(project_id, pid, "Orphan exited before it was signalled");
                report.skipped_pids.push(pid);
                self.untrack_process(project_id);
                false
            }
            Err(e) => {
                warn!(project_id, pid, error = %e, "Failed to signal orphan");
                report.failed_pids.push(pid);
                false
            }
        }
    }

    fn persist(&self, pids: &HashMap<String, u32>) {
        let Some(ref path) = self.state_path else {
            return;
        };
        if let Err(e) = save_state(path, pids) {
            warn!(path = %path.display(), error = %e, "Failed to persist tracked pids");
        }
    }
}

fn load_state(path: &Path) -> flock_core::Result<HashMap<String, u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn save_state(path: &Path, pids: &HashMap<String, u32>) -> flock_core::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(pids)?)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn track_and_untrack() {
        let tracker = ProcessTracker::default();
        tracker.track_process("p1", 100);
        tracker.track_process("p1", 101);
        assert_eq!(tracker.tracked_pid("p1"), Some(101));
        assert_eq!(tracker.untrack_process("p1"), Some(101));
        assert_eq!(tracker.untrack_process("p1"), None);
    }

    #[tokio::test]
    async fn dead_pid_is_skipped_not_killed() {
        let tracker = ProcessTracker::new(Duration::from_millis(10));
        tracker.track_process("ghost", 999_999_999);

        let report = tracker.cleanup_orphan_processes().await;
        assert_eq!(report.skipped_pids, vec![999_999_999]);
        assert!(report.killed_pids.is_empty());
        assert_eq!(report.skipped, 1);
        assert!(tracker.tracked().is_empty());
    }

    #[test]
    fn pid_gone_before_signal_is_skipped() {
        let tracker = ProcessTracker::default();
        tracker.track_process("racer", 4242);
        let mut report = CleanupReport::default();

        let signalled = tracker.record_signal(
            "racer",
            4242,
            Err(KillError::NoSuchProcess(4242)),
            &mut report,
        );

        assert!(!signalled);
        assert_eq!(report.skipped_pids, vec![4242]);
        assert!(report.killed_pids.is_empty());
        assert!(report.failed_pids.is_empty());
        assert_eq!(tracker.tracked_pid("racer"), None);
    }

    #[test]
    fn signal_failure_keeps_the_pid_tracked() {
        let tracker = ProcessTracker::default();
        tracker.track_process("stubborn", 4242);
        let mut report = CleanupReport::default();

        let signalled = tracker.record_signal(
            "stubborn",
            4242,
            Err(KillError::Os {
                pid: 4242,
                reason: "Operation not permitted".into(),
            }),
            &mut report,
        );

        assert!(!signalled);
        assert_eq!(report.failed_pids, vec![4242]);
        assert_eq!(tracker.tracked_pid("stubborn"), Some(4242));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_orphan_is_killed() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        // Reap promptly so the liveness check does not see a zombie.
        let reaper = tokio::spawn(async move { child.wait().await });

        let tracker = ProcessTracker::new(Duration::from_millis(300));
        tracker.track_process("orphan", pid);
        let report = tracker.cleanup_orphan_processes().await;

        assert_eq!(report.killed_pids, vec![pid]);
        assert_eq!(report.failed, 0);
        assert!(!reaper.await.unwrap().unwrap().success());
    }

    #[test]
    fn state_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("pids.json");
        {
            let tracker = ProcessTracker::with_state_file(&path, Duration::ZERO).unwrap();
            tracker.track_process("p1", 4242);
            tracker.track_process("p2", 4343);
            tracker.untrack_process("p2");
        }
        let reloaded = ProcessTracker::with_state_file(&path, Duration::ZERO).unwrap();
        assert_eq!(reloaded.tracked_pid("p1"), Some(4242));
        assert_eq!(reloaded.tracked_pid("p2"), None);
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pids.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ProcessTracker::with_state_file(&path, Duration::ZERO).is_err());
    }
}
