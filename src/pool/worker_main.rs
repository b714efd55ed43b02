//! Worker subprocess entry point.
//!
//! A worker is the host program started with [`WORKER_ENV`](super::spawn::WORKER_ENV)
//! set. It announces itself with `Ready`, then executes `Run` requests one at a time
//! until it is told to exit or its stdin closes.

use super::ipc::{MessageReader, MessageWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::spawn::{NESTED_POOLS_ENV, WORKER_ENV};
use crate::logging::{self, LogConfig};
use crate::registry::Registry;
use nix::sys::signal::{SigHandler, Signal, signal};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

/// Whether this process was started as a pool worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| v == "1")
}

/// Whether this process may create a worker pool.
///
/// Always true outside a pool; inside one only for non-daemon workers.
pub fn nested_pools_allowed() -> bool {
    !is_worker_process() || std::env::var(NESTED_POOLS_ENV).is_ok_and(|v| v == "1")
}

/// Serve tasks and exit if this process is a worker; return immediately otherwise.
///
/// Call this first thing in `main`, with the same registry the controller uses:
///
/// ```no_run
/// let registry = procjob::builtins::registry();
/// procjob::run_if_worker(&registry);
/// // ... normal program ...
/// ```
pub fn run_if_worker(registry: &Registry) {
    if is_worker_process() {
        run_worker_main(registry);
    }
}

/// Run the worker main loop and exit the process.
pub fn run_worker_main(registry: &Registry) -> ! {
    // Safety: replacing dispositions with SIG_IGN installs no handler code.
    unsafe {
        // Pipe errors surface as io::Error.
        signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
        // The controller decides when workers stop.
        signal(Signal::SIGINT, SigHandler::SigIgn).ok();
    }

    logging::init(LogConfig::for_worker().with_env_overrides());

    let (mut reader, mut writer) = match claim_stdio() {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed to set up its pipes");
            std::process::exit(1);
        }
    };

    match worker_loop(registry, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(pid = std::process::id(), error = %e, "Worker loop failed");
            std::process::exit(1);
        }
    }
}

/// Move the protocol pipes off fds 0 and 1.
///
/// Afterwards fd 0 reads `/dev/null` and fd 1 writes to stderr, so a unit-of-work
/// function that prints or reads stdin cannot corrupt the message stream.
fn claim_stdio() -> io::Result<(MessageReader, MessageWriter)> {
    let devnull = std::fs::File::open("/dev/null")?;

    // Safety: fds 0, 1 and 2 are open in a spawned worker; the duplicates are owned
    // exclusively by the returned PipeFds.
    unsafe {
        // Close-on-exec, so processes this worker spawns do not hold the protocol pipes.
        let requests = nix::libc::fcntl(0, nix::libc::F_DUPFD_CLOEXEC, 3);
        if requests < 0 {
            return Err(io::Error::last_os_error());
        }
        let requests = OwnedFd::from_raw_fd(requests);

        let responses = nix::libc::fcntl(1, nix::libc::F_DUPFD_CLOEXEC, 3);
        if responses < 0 {
            return Err(io::Error::last_os_error());
        }
        let responses = OwnedFd::from_raw_fd(responses);

        if nix::libc::dup2(devnull.as_raw_fd(), 0) < 0 || nix::libc::dup2(2, 1) < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((
            MessageReader::new(PipeFd::new(requests)),
            MessageWriter::new(PipeFd::new(responses)),
        ))
    }
}

/// Ready, then one outcome per `Run` request, until `Exit` or EOF.
fn worker_loop(
    registry: &Registry,
    reader: &mut MessageReader,
    writer: &mut MessageWriter,
) -> io::Result<()> {
    writer.write_message(&WorkResponse::ready())?;

    loop {
        let request = match reader.read_message::<WorkRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                writer.write_message(&WorkResponse::error(format!("Invalid request: {}", e)))?;
                continue;
            }
            Err(e) => return Err(e),
        };

        match request {
            WorkRequest::Exit => return Ok(()),
            WorkRequest::Run { task } => {
                tracing::trace!(index = task.index, func = %task.func, "Worker running task");
                let outcome = task.execute(registry);
                writer.write_message(&WorkResponse::outcome(task.index, outcome))?;
            }
        }
    }
}
