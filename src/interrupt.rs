//! SIGINT handling for the controlling process.
//!
//! While an [`InterruptGuard`] is alive, SIGINT no longer terminates the process; each
//! delivery is counted instead, and every guard can ask whether an interrupt arrived
//! since it was created. Nothing is lost while a pool is being built: a Ctrl+C during
//! worker spawning is simply noticed as soon as the controller starts waiting.
//!
//! Guards nest and may be held from several threads at once. The first guard installs
//! the handler; the last one to drop restores whatever disposition was there before.

use crate::error::{JobError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ffi::c_int;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of SIGINTs received while any guard was installed.
static INTERRUPTS: AtomicU64 = AtomicU64::new(0);

struct Installed {
    previous: SigAction,
    guards: usize,
}

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

extern "C" fn on_sigint(_signal: c_int) {
    // Only async-signal-safe work here.
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// Scoped SIGINT capture for one job run.
#[derive(Debug)]
pub struct InterruptGuard {
    baseline: u64,
}

impl InterruptGuard {
    /// Install the counting handler (if not already installed) and take a baseline.
    pub fn install() -> Result<Self> {
        let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
        match installed.as_mut() {
            Some(state) => state.guards += 1,
            None => {
                let action = SigAction::new(
                    SigHandler::Handler(on_sigint),
                    SaFlags::SA_RESTART,
                    SigSet::empty(),
                );
                // Safety: the handler only touches an atomic counter.
                let previous = unsafe { signal::sigaction(Signal::SIGINT, &action) }.map_err(
                    |e| JobError::Pool(format!("Failed to install SIGINT handler: {}", e)),
                )?;
                *installed = Some(Installed {
                    previous,
                    guards: 1,
                });
                tracing::trace!("SIGINT handler installed");
            }
        }

        Ok(Self {
            baseline: INTERRUPTS.load(Ordering::SeqCst),
        })
    }

    /// Whether SIGINT was delivered since this guard was installed.
    pub fn interrupted(&self) -> bool {
        INTERRUPTS.load(Ordering::SeqCst) != self.baseline
    }

    /// `Err(JobError::Interrupted)` if an interrupt is pending for this guard.
    pub fn check(&self) -> Result<()> {
        if self.interrupted() {
            Err(JobError::Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = installed.as_mut() else {
            return;
        };
        state.guards -= 1;
        if state.guards > 0 {
            return;
        }
        let Some(Installed { previous, .. }) = installed.take() else {
            return;
        };
        // Safety: restores the disposition that was active before install().
        match unsafe { signal::sigaction(Signal::SIGINT, &previous) } {
            Ok(_) => tracing::trace!("SIGINT handler restored"),
            Err(e) => tracing::warn!(error = %e, "Failed to restore SIGINT handler"),
        }
    }
}

/// Ignore SIGINT in a freshly forked worker before it execs.
///
/// Ignored dispositions survive `exec`, so the worker never sees the terminal's Ctrl+C;
/// the controller decides when workers stop.
///
/// # Safety
/// Must only be called in the child between `fork` and `exec` (it is async-signal-safe).
pub(crate) unsafe fn ignore_in_child() -> nix::Result<()> {
    unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) }.map(|_| ())
}

/// Serializes tests that raise SIGINT or hold guards across a pool run.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counter is process-wide, so this holds the lock that pool tests take.
    #[test]
    fn test_guard_counts_and_restores() {
        let _lock = test_lock();
        let outer = InterruptGuard::install().unwrap();
        assert!(!outer.interrupted());
        assert!(outer.check().is_ok());

        {
            let inner = InterruptGuard::install().unwrap();
            signal::raise(Signal::SIGINT).unwrap();
            assert!(inner.interrupted());
            assert!(matches!(inner.check(), Err(JobError::Interrupted)));
        }

        // Still installed after the inner guard dropped.
        assert!(outer.interrupted());
        assert!(INSTALLED.lock().unwrap().is_some());

        let later = InterruptGuard::install().unwrap();
        assert!(!later.interrupted());
        drop(later);
        drop(outer);

        assert!(INSTALLED.lock().unwrap().is_none());
    }
}
