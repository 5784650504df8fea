//! Process-tree signalling.
//!
//! Workers are spawned as process-group leaders on POSIX, so signalling the
//! group reaches every helper the worker forked. On Windows the tree is
//! walked by `taskkill /T`.

use thiserror::Error;
use tracing::debug;

/// Two-phase termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Graceful request (`SIGTERM`, `taskkill` without `/F`).
    Terminate,
    /// Forceful kill (`SIGKILL`, `taskkill /F`).
    Kill,
}

/// Errors from signalling a process.
#[derive(Debug, Error)]
pub enum KillError {
    #[error("No such process: {0}")]
    NoSuchProcess(u32),

    #[error("Invalid pid: {0}")]
    InvalidPid(u32),

    #[error("Failed to signal process {pid}: {reason}")]
    Os { pid: u32, reason: String },
}

/// Send `signal` to `pid` and everything below it.
pub fn kill_tree(pid: u32, signal: KillSignal) -> Result<(), KillError> {
    debug!(pid, ?signal, "Signalling process tree");
    platform::kill_tree(pid, signal)
}

/// Send `signal` to a single process. A process that no longer exists is not
/// an error.
pub fn kill_process(pid: u32, signal: KillSignal) -> Result<(), KillError> {
    match signal_process(pid, signal) {
        Err(KillError::NoSuchProcess(_)) => Ok(()),
        other => other,
    }
}

/// Send `signal` to a single process, reporting a missing one as
/// [`KillError::NoSuchProcess`].
pub fn signal_process(pid: u32, signal: KillSignal) -> Result<(), KillError> {
    debug!(pid, ?signal, "Signalling process");
    platform::kill_one(pid, signal)
}

/// Zero-signal liveness check.
pub fn is_process_alive(pid: u32) -> bool {
    platform::is_alive(pid)
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    use super::{KillError, KillSignal};

    fn to_pid(pid: u32) -> Result<Pid, KillError> {
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(Pid::from_raw)
            .ok_or(KillError::InvalidPid(pid))
    }

    const fn to_signal(signal: KillSignal) -> Signal {
        match signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }

    fn map_errno(pid: u32, errno: Errno) -> KillError {
        if errno == Errno::ESRCH {
            KillError::NoSuchProcess(pid)
        } else {
            KillError::Os {
                pid,
                reason: errno.desc().to_string(),
            }
        }
    }

    pub fn kill_tree(pid: u32, signal: KillSignal) -> Result<(), KillError> {
        let target = to_pid(pid)?;
        match signal::killpg(target, to_signal(signal)) {
            Ok(()) => Ok(()),
            // Not a group leader (or the group is gone): fall back to the pid.
            Err(Errno::ESRCH) => kill_one(pid, signal),
            Err(errno) => Err(map_errno(pid, errno)),
        }
    }

    pub fn kill_one(pid: u32, signal: KillSignal) -> Result<(), KillError> {
        let target = to_pid(pid)?;
        signal::kill(target, to_signal(signal)).map_err(|errno| map_errno(pid, errno))
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::process::{Command, Stdio};

    use super::{KillError, KillSignal};

    fn taskkill(pid: u32, signal: KillSignal, tree: bool) -> Result<(), KillError> {
        let mut cmd = Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        if tree {
            cmd.arg("/T");
        }
        if signal == KillSignal::Kill {
            cmd.arg("/F");
        }
        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| KillError::Os {
                pid,
                reason: e.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        // taskkill exits with 128 when the pid does not exist.
        if output.status.code() == Some(128) || !is_alive(pid) {
            return Err(KillError::NoSuchProcess(pid));
        }
        Err(KillError::Os {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    pub fn kill_tree(pid: u32, signal: KillSignal) -> Result<(), KillError> {
        taskkill(pid, signal, true)
    }

    pub fn kill_one(pid: u32, signal: KillSignal) -> Result<(), KillError> {
        taskkill(pid, signal, false)
    }

    pub fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_process_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn kill_process_ignores_missing_process() {
        assert!(kill_process(999_999_999, KillSignal::Terminate).is_ok());
    }

    #[test]
    fn signal_process_reports_missing_process() {
        let err = signal_process(999_999_999, KillSignal::Terminate).unwrap_err();
        assert!(matches!(err, KillError::NoSuchProcess(999_999_999)));
    }

    #[test]
    fn kill_tree_reports_missing_process() {
        let err = kill_tree(999_999_999, KillSignal::Kill).unwrap_err();
        assert!(matches!(err, KillError::NoSuchProcess(999_999_999)));
    }

    #[test]
    fn pid_zero_is_rejected() {
        assert!(matches!(
            kill_process(0, KillSignal::Terminate),
            Err(KillError::InvalidPid(0))
        ));
        assert!(!is_process_alive(0));
    }

    #[tokio::test]
    async fn terminates_whole_process_group() {
        use std::process::Stdio;

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(is_process_alive(pid));

        kill_tree(pid, KillSignal::Terminate).unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("process group exits after SIGTERM")
            .unwrap();
        assert!(!status.success());
    }
}
