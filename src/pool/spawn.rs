//! Worker subprocess spawning.
//!
//! Workers are the host program re-executed with [`WORKER_ENV`] set; the host's `main`
//! hands control to [`crate::run_if_worker`] before doing anything else.

use super::proc::Proc;
use crate::error::{JobError, Result};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Marks a process as a pool worker.
pub const WORKER_ENV: &str = "PROCJOB_WORKER";

/// Tells a worker whether it may create pools of its own (`1`) or not (`0`).
pub const NESTED_POOLS_ENV: &str = "PROCJOB_NESTED_POOLS";

/// Configuration for worker processes.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to run as a worker.
    pub program: PathBuf,
    /// Non-daemon workers: may own nested pools and outlive their parent.
    pub allow_nested_pools: bool,
}

impl WorkerConfig {
    /// Workers running the current executable.
    pub fn current_exe(allow_nested_pools: bool) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| JobError::Pool(format!("Failed to get current executable: {}", e)))?;
        Ok(Self {
            program,
            allow_nested_pools,
        })
    }
}

/// Spawn one worker subprocess.
///
/// In the child, before `exec`: SIGINT is ignored (the controller owns interrupt
/// handling) and, for daemon workers on Linux, the kernel is asked to SIGKILL the
/// worker if its parent dies.
pub fn spawn_worker(config: &WorkerConfig) -> Result<Proc> {
    let mut cmd = Command::new(&config.program);
    cmd.env(WORKER_ENV, "1");
    cmd.env(
        NESTED_POOLS_ENV,
        if config.allow_nested_pools { "1" } else { "0" },
    );

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let daemon = !config.allow_nested_pools;
    // Safety: the closure only makes async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            crate::interrupt::ignore_in_child()?;
            if daemon {
                die_with_parent()?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        JobError::Pool(format!(
            "Failed to spawn worker {}: {}",
            config.program.display(),
            e
        ))
    })?;

    Proc::from_child(child)
}

/// Have the kernel SIGKILL this process when its parent exits.
#[cfg(target_os = "linux")]
fn die_with_parent() -> std::io::Result<()> {
    // Safety: plain prctl syscall, async-signal-safe.
    if unsafe { nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGKILL) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent() -> std::io::Result<()> {
    Ok(())
}

/// Spawn a named dispatcher thread.
pub fn spawn_dispatcher_thread<F, T>(name: String, f: F) -> Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| JobError::Pool(format!("Failed to spawn dispatcher thread: {}", e)))
}
