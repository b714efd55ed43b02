//! Why a worker process went away.

use crate::error::TaskError;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Failure kind recorded for a task whose worker died under it.
pub const WORKER_DIED: &str = "WorkerDied";

/// Reason a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Already reaped or otherwise unknown.
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => {
                "killed by SIGKILL (possibly the OOM killer)".to_string()
            }
            Self::Signaled(Signal::SIGSEGV) => "crashed with SIGSEGV".to_string(),
            Self::Signaled(Signal::SIGABRT) => "aborted (SIGABRT)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }

    /// Task failure for the task that was in flight when this happened.
    pub fn task_error(&self, worker_id: usize, pid: i32) -> TaskError {
        TaskError::new(
            WORKER_DIED,
            format!("worker {} (pid {}) {}", worker_id, pid, self.description()),
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_from_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(TerminationReason::from(status), TerminationReason::Exited(3));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false);
        assert_eq!(
            TerminationReason::from(status),
            TerminationReason::Signaled(Signal::SIGTERM)
        );

        assert_eq!(
            TerminationReason::from(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGKILL).is_success());
    }

    #[test]
    fn test_descriptions() {
        assert!(TerminationReason::Signaled(Signal::SIGKILL).to_string().contains("OOM"));
        assert!(TerminationReason::Signaled(Signal::SIGSEGV).to_string().contains("SIGSEGV"));
        assert!(TerminationReason::Signaled(Signal::SIGHUP).to_string().contains("SIGHUP"));
        assert_eq!(TerminationReason::Exited(7).to_string(), "exited with code 7");
    }

    #[test]
    fn test_task_error() {
        let failure = TerminationReason::Exited(3).task_error(2, 4242);
        assert_eq!(failure.kind, WORKER_DIED);
        assert!(failure.message.contains("worker 2"));
        assert!(failure.message.contains("4242"));
        assert!(failure.message.contains("code 3"));
    }
}
