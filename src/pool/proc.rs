//! Process handle for a worker subprocess.
//!
//! Wraps a child process with its request/response pipes and tracks whether it has
//! been reaped, so a PID is never signalled after `waitpid` returned it.

use super::ipc::{MessageReader, MessageWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::termination::TerminationReason;
use crate::error::{JobError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How often to poll for exit while stopping a worker.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Time a worker gets to die after SIGTERM before SIGKILL follows.
pub const TERM_GRACE: Duration = Duration::from_millis(200);

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: MessageWriter,
    reader: MessageReader,
    reaped: bool,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: MessageWriter::new(stdin),
            reader: MessageReader::new(stdout),
            reaped: false,
        }
    }

    /// Take over a spawned child's stdin and stdout.
    ///
    /// The `Child` itself is dropped; reaping happens through this handle.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobError::Pool("Worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Pool("Worker stdout not captured".into()))?;

        Ok(Self::new(pid, PipeFd::new(stdin), PipeFd::new(stdout)))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        self.writer
            .write_message(request)
            .map_err(|e| JobError::Pool(format!("Failed to send to worker {}: {}", self.pid, e)))
    }

    /// Receive a response. `None` means the worker closed its end (usually: it died).
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        self.reader.read_message().map_err(|e| {
            JobError::Pool(format!("Failed to receive from worker {}: {}", self.pid, e))
        })
    }

    /// Reap the process if it has exited (non-blocking).
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Ok(Some(TerminationReason::Unknown));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status.into()))
            }
            Err(e) => {
                self.reaped = true;
                Err(JobError::Pool(format!("waitpid({}) failed: {}", self.pid, e)))
            }
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| JobError::Pool(format!("waitpid({}) failed: {}", self.pid, e)));
        self.reaped = true;
        Ok(status?.into())
    }

    /// Send a signal unless the process was already reaped.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, sig)
            .map_err(|e| JobError::Pool(format!("Failed to send {:?} to {}: {}", sig, self.pid, e)))
    }

    /// Poll for exit until `timeout` elapses or `give_up` returns true.
    fn wait_for_exit(
        &mut self,
        timeout: Duration,
        give_up: impl Fn() -> bool,
    ) -> Option<TerminationReason> {
        let start = Instant::now();
        loop {
            match self.try_wait() {
                Ok(Some(reason)) => return Some(reason),
                Ok(None) => {}
                Err(_) => return Some(TerminationReason::Unknown),
            }
            if start.elapsed() >= timeout || give_up() {
                return None;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Forcibly stop: SIGTERM, then SIGKILL if it outlives `grace`. Always reaps.
    pub fn terminate(&mut self, grace: Duration) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let _ = self.signal(Signal::SIGTERM);
        if let Some(reason) = self.wait_for_exit(grace, || false) {
            return Ok(reason);
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Gracefully stop: ask the worker to exit, then escalate after `timeout`.
    ///
    /// Escalates early once `abandon` returns true.
    pub fn stop(
        &mut self,
        timeout: Duration,
        abandon: impl Fn() -> bool,
    ) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let _ = self.send(&WorkRequest::Exit);
        if let Some(reason) = self.wait_for_exit(timeout, abandon) {
            return Ok(reason);
        }
        tracing::debug!(pid = %self.pid, "Worker ignored exit request, terminating");
        self.terminate(TERM_GRACE)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}
