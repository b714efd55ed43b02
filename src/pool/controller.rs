//! Worker pool controller.
//!
//! One dispatcher thread per worker slot pulls tasks off a shared queue, runs them on
//! its worker process and reports each outcome, tagged with its submission index, to
//! the controller. The controller waits for outcomes in submission order and decides
//! when the run is over: all tasks accounted for, a fatal failure, a timeout or an
//! interrupt.

use super::proc::{Proc, TERM_GRACE};
use super::protocol::{WorkRequest, WorkResponse};
use super::spawn::{WorkerConfig, spawn_dispatcher_thread, spawn_worker};
use super::termination::TerminationReason;
use crate::error::{JobError, Result};
use crate::interrupt::InterruptGuard;
use crate::outputs::{self, ChannelOutputs, OutputCollector, OutputSink, Received};
use crate::task::{Task, TaskOutcome};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// Longest the controller blocks before re-checking for interrupts.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Time a worker gets to honour an exit request before it is terminated.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-task timeout: 15 hours.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60 * 60);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on worker processes; the pool never exceeds the task count.
    pub worker_count: usize,
    /// Per-task timeout, counted from when the controller starts waiting on the task.
    pub timeout: Duration,
    /// Record worker failures instead of aborting the run.
    pub suppress_worker_failures: bool,
    /// Replace a worker after this many tasks.
    pub max_tasks_per_worker: Option<usize>,
    pub worker: WorkerConfig,
}

impl WorkerPoolConfig {
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker_count: 4,
            timeout: DEFAULT_TIMEOUT,
            suppress_worker_failures: false,
            max_tasks_per_worker: None,
            worker,
        }
    }
}

/// Counters reported when a pool is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub worker_count: usize,
    pub tasks_completed: usize,
    /// Workers replaced after dying or being recycled.
    pub restarts: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// PIDs of unreaped workers, by slot.
///
/// A slot is cleared before its process is reaped, so signals sent through this table
/// never reach a recycled PID.
#[derive(Debug, Default)]
struct LiveTable {
    pids: Vec<Option<Pid>>,
    aborting: bool,
}

/// State shared between the controller and its dispatcher threads.
struct Shared {
    queue: Mutex<VecDeque<Task>>,
    live: Mutex<LiveTable>,
    fatal: Mutex<Option<JobError>>,
    tasks_completed: AtomicUsize,
    restarts: AtomicUsize,
}

impl Shared {
    fn new(tasks: Vec<Task>, worker_count: usize) -> Self {
        Self {
            queue: Mutex::new(tasks.into()),
            live: Mutex::new(LiveTable {
                pids: vec![None; worker_count],
                aborting: false,
            }),
            fatal: Mutex::new(None),
            tasks_completed: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    fn aborting(&self) -> bool {
        lock(&self.live).aborting
    }

    fn next_task(&self) -> Option<Task> {
        if self.aborting() {
            return None;
        }
        lock(&self.queue).pop_front()
    }

    /// Record a worker's PID. Returns false if the pool is already being torn down.
    fn register(&self, slot: usize, pid: Pid) -> bool {
        let mut live = lock(&self.live);
        if live.aborting {
            return false;
        }
        live.pids[slot] = Some(pid);
        true
    }

    fn unregister(&self, slot: usize) {
        lock(&self.live).pids[slot] = None;
    }

    fn live_count(&self) -> usize {
        lock(&self.live).pids.iter().flatten().count()
    }

    /// Stop handing out work and signal every live worker.
    fn begin_abort(&self, sig: Signal) -> usize {
        let mut live = lock(&self.live);
        live.aborting = true;
        Self::signal_all(&live, sig)
    }

    fn signal_live(&self, sig: Signal) -> usize {
        Self::signal_all(&lock(&self.live), sig)
    }

    fn signal_all(live: &LiveTable, sig: Signal) -> usize {
        let mut sent = 0;
        for pid in live.pids.iter().flatten() {
            match signal::kill(*pid, sig) {
                Ok(()) => sent += 1,
                Err(e) => trace!(pid = %pid, error = %e, "Signal not delivered"),
            }
        }
        sent
    }

    /// Record a fatal pool error; the first one wins.
    fn fail(&self, err: JobError) {
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn take_fatal(&self) -> Option<JobError> {
        lock(&self.fatal).take()
    }
}

/// One worker slot, owned by its dispatcher thread.
struct Worker {
    id: usize,
    proc: Option<Proc>,
    config: WorkerConfig,
    max_tasks: Option<usize>,
    /// Tasks run by the current process.
    tasks_run: usize,
}

impl Worker {
    fn new(id: usize, config: WorkerConfig, max_tasks: Option<usize>) -> Self {
        Self {
            id,
            proc: None,
            config,
            max_tasks,
            tasks_run: 0,
        }
    }

    /// Spawn a process for this slot if it has none.
    ///
    /// Leaves the slot empty (and returns `Ok`) when the pool started aborting.
    fn ensure_ready(&mut self, shared: &Shared) -> Result<()> {
        if self.proc.is_some() || shared.aborting() {
            return Ok(());
        }

        let mut proc = spawn_worker(&self.config)?;
        if !shared.register(self.id, proc.pid()) {
            let _ = proc.terminate(TERM_GRACE);
            return Ok(());
        }

        match wait_for_ready(self.id, &mut proc) {
            Ok(()) => {
                debug!(worker_id = self.id, pid = %proc.pid(), "Worker ready");
                self.proc = Some(proc);
                self.tasks_run = 0;
                Ok(())
            }
            Err(e) => {
                shared.unregister(self.id);
                let _ = proc.terminate(TERM_GRACE);
                if shared.aborting() { Ok(()) } else { Err(e) }
            }
        }
    }

    /// Take the process out of the live table, then stop and reap it.
    fn retire(&mut self, shared: &Shared, graceful: bool) -> Option<TerminationReason> {
        let mut proc = self.proc.take()?;
        shared.unregister(self.id);
        let result = if graceful {
            proc.stop(STOP_TIMEOUT, || shared.aborting())
        } else {
            proc.terminate(TERM_GRACE)
        };
        match result {
            Ok(reason) => {
                if graceful && !reason.is_success() {
                    debug!(worker_id = self.id, reason = %reason, "Worker did not exit cleanly");
                }
                Some(reason)
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "Failed to stop worker");
                None
            }
        }
    }

    /// Reap a process that closed its end of the pipe.
    fn reap_dead(&mut self, shared: &Shared) -> TerminationReason {
        let Some(mut proc) = self.proc.take() else {
            return TerminationReason::Unknown;
        };
        shared.unregister(self.id);
        proc.wait().unwrap_or(TerminationReason::Unknown)
    }

    fn should_recycle(&self) -> bool {
        self.max_tasks.is_some_and(|max| self.tasks_run >= max)
    }

    /// Dispatcher thread body: run tasks until the queue is empty or the pool aborts.
    fn run(mut self, shared: Arc<Shared>, mut sink: ChannelOutputs) {
        let mut clean = true;
        while let Some(task) = shared.next_task() {
            if let Err(e) = self.ensure_ready(&shared) {
                shared.fail(e);
                clean = false;
                break;
            }
            let Some(proc) = self.proc.as_mut() else {
                break;
            };

            let index = task.index;
            let func = task.func.clone();
            let pid = proc.pid();
            let response = proc
                .send(&WorkRequest::run(task))
                .and_then(|()| proc.recv());

            match response {
                Ok(Some(WorkResponse::Outcome {
                    index: reported,
                    outcome,
                })) => {
                    if reported != index {
                        shared.fail(JobError::Pool(format!(
                            "Worker {} answered task {} with an outcome for task {}",
                            self.id, index, reported
                        )));
                        clean = false;
                        break;
                    }
                    self.tasks_run += 1;
                    shared.tasks_completed.fetch_add(1, Ordering::SeqCst);
                    sink.add(index, outcome);

                    if self.should_recycle() {
                        debug!(
                            worker_id = self.id,
                            pid = %pid,
                            tasks_run = self.tasks_run,
                            "Recycling worker"
                        );
                        self.retire(&shared, true);
                        shared.restarts.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(Some(other)) => {
                    shared.fail(JobError::Pool(format!(
                        "Worker {} sent unexpected response to task {}: {:?}",
                        self.id, index, other
                    )));
                    clean = false;
                    break;
                }
                Ok(None) | Err(_) if shared.aborting() => break,
                Ok(None) => {
                    let reason = self.reap_dead(&shared);
                    self.report_death(&shared, &mut sink, index, &func, pid, reason);
                }
                Err(e) => {
                    warn!(worker_id = self.id, pid = %pid, error = %e, "Lost contact with worker");
                    let reason = self
                        .retire(&shared, false)
                        .unwrap_or(TerminationReason::Unknown);
                    self.report_death(&shared, &mut sink, index, &func, pid, reason);
                }
            }
        }

        let graceful = clean && !shared.aborting();
        self.retire(&shared, graceful);
        trace!(worker_id = self.id, "Dispatcher finished");
    }

    fn report_death(
        &self,
        shared: &Shared,
        sink: &mut ChannelOutputs,
        index: usize,
        func: &str,
        pid: Pid,
        reason: TerminationReason,
    ) {
        let failure = reason.task_error(self.id, pid.as_raw());
        tracing::error!(
            index,
            func,
            kind = %failure.kind,
            message = %failure.message,
            "Task failed"
        );
        shared.tasks_completed.fetch_add(1, Ordering::SeqCst);
        shared.restarts.fetch_add(1, Ordering::SeqCst);
        sink.add(index, TaskOutcome::Failed(failure));
    }
}

fn wait_for_ready(id: usize, proc: &mut Proc) -> Result<()> {
    match proc.recv()? {
        Some(WorkResponse::Ready { .. }) => Ok(()),
        Some(other) => Err(JobError::Pool(format!(
            "Worker {} sent unexpected response instead of Ready: {:?}",
            id, other
        ))),
        None => Err(JobError::Pool(format!(
            "Worker {} closed connection before Ready",
            id
        ))),
    }
}

/// A running pool: dispatcher threads plus the controller-side bookkeeping.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<Shared>,
    dispatchers: Vec<JoinHandle<()>>,
    worker_count: usize,
    // Declared last: the SIGINT handler stays installed until workers are gone.
    guard: InterruptGuard,
}

impl WorkerPool {
    /// Run `tasks` on a fresh pool and return their outcomes in submission order.
    ///
    /// With no tasks this returns immediately without spawning anything.
    pub fn run(config: WorkerPoolConfig, tasks: Vec<Task>) -> Result<Vec<TaskOutcome>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        if config.worker_count == 0 {
            return Err(JobError::Config(
                "processes must be at least 1".to_string(),
            ));
        }

        let task_count = tasks.len();
        let (sink, collector) = outputs::channel(task_count);
        let mut pool = Self::start(config, tasks, sink)?;
        pool.collect(collector)
    }

    /// Install the interrupt guard and start one dispatcher per worker slot.
    #[instrument(level = "debug", skip_all, fields(tasks = tasks.len()))]
    fn start(config: WorkerPoolConfig, tasks: Vec<Task>, sink: ChannelOutputs) -> Result<Self> {
        let guard = InterruptGuard::install()?;
        let worker_count = config.worker_count.min(tasks.len());
        let shared = Arc::new(Shared::new(tasks, worker_count));

        let mut pool = Self {
            config,
            shared,
            dispatchers: Vec::with_capacity(worker_count),
            worker_count,
            guard,
        };

        for id in 0..worker_count {
            let worker = Worker::new(
                id,
                pool.config.worker.clone(),
                pool.config.max_tasks_per_worker,
            );
            let shared = Arc::clone(&pool.shared);
            let sink = sink.clone();
            // On failure `pool` drops here, which aborts the dispatchers already running.
            let handle = spawn_dispatcher_thread(format!("procjob-dispatch-{}", id), move || {
                worker.run(shared, sink)
            })?;
            pool.dispatchers.push(handle);
        }

        debug!(
            worker_count,
            program = %pool.config.worker.program.display(),
            nested = pool.config.worker.allow_nested_pools,
            "Worker pool started"
        );
        Ok(pool)
    }

    /// Wait for every outcome in submission order, applying the failure policy.
    fn collect(&mut self, mut collector: OutputCollector) -> Result<Vec<TaskOutcome>> {
        let task_count = collector.len();
        let timeout = self.config.timeout;
        let mut next = 0;
        let mut deadline = Instant::now() + timeout;

        while next < task_count {
            if let Err(err) = self.guard.check() {
                self.abort("interrupt");
                return Err(err);
            }
            if let Some(outcome) = collector.get(next) {
                if let TaskOutcome::Failed(failure) = outcome
                    && !self.config.suppress_worker_failures
                {
                    let err = JobError::Worker {
                        index: next,
                        failure: failure.clone(),
                    };
                    self.abort("worker failure");
                    return Err(err);
                }
                next += 1;
                deadline = Instant::now() + timeout;
                continue;
            }

            if let Some(err) = self.shared.take_fatal() {
                self.abort("pool error");
                return Err(err);
            }

            let now = Instant::now();
            if now >= deadline {
                self.abort("timeout");
                return Err(JobError::Timeout {
                    index: next,
                    timeout,
                });
            }

            match collector.recv_timeout(POLL_SLICE.min(deadline - now)) {
                Received::Outcome(index) => trace!(index, waiting_for = next, "Outcome received"),
                Received::Timeout => {}
                Received::Disconnected => {
                    let err = self.shared.take_fatal().unwrap_or_else(|| {
                        JobError::Pool(format!(
                            "All dispatchers exited with task {} outstanding",
                            next
                        ))
                    });
                    self.abort("dispatchers gone");
                    return Err(err);
                }
            }
        }

        self.shutdown()?;
        collector
            .into_outcomes()
            .ok_or_else(|| JobError::Pool("Outcome missing after completion".to_string()))
    }

    /// Normal completion: dispatchers stop their workers once the queue is empty.
    ///
    /// An interrupt while they do so turns the shutdown into an abort.
    fn shutdown(&mut self) -> Result<()> {
        while self.dispatchers.iter().any(|handle| !handle.is_finished()) {
            if let Err(err) = self.guard.check() {
                self.abort("interrupt during shutdown");
                return Err(err);
            }
            std::thread::sleep(POLL_SLICE);
        }
        self.join();
        self.log_stats();
        self.guard.check()
    }

    /// Terminate every worker: SIGTERM, SIGKILL for survivors after a grace period.
    fn abort(&mut self, reason: &str) {
        let signalled = self.shared.begin_abort(Signal::SIGTERM);
        debug!(reason, signalled, "Terminating worker pool");

        let deadline = Instant::now() + TERM_GRACE;
        while self.shared.live_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let killed = self.shared.signal_live(Signal::SIGKILL);
        if killed > 0 {
            debug!(killed, "Killed workers that outlived SIGTERM");
        }

        self.join();
        self.log_stats();
    }

    fn join(&mut self) {
        for handle in self.dispatchers.drain(..) {
            if handle.join().is_err() {
                warn!("Dispatcher thread panicked");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.worker_count,
            tasks_completed: self.shared.tasks_completed.load(Ordering::SeqCst),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            worker_count = stats.worker_count,
            tasks_completed = stats.tasks_completed,
            restarts = stats.restarts,
            "Worker pool finished"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.dispatchers.is_empty() {
            self.abort("pool dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::test_lock;
    use crate::pool::termination::WORKER_DIED;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// A shell script standing in for a worker binary.
    fn script(dir: &Path, name: &str, body: &str) -> WorkerConfig {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        WorkerConfig {
            program: path,
            allow_nested_pools: true,
        }
    }

    const READY: &str = r#"echo '{"type":"ready","pid":1}'"#;
    const ANSWER_SEVEN: &str =
        r#"echo '{"type":"outcome","index":0,"outcome":{"status":"success","value":7}}'"#;

    fn tasks(n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new(i, "f", json!(i), vec![])).collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerPoolConfig::new(WorkerConfig {
            program: PathBuf::from("/bin/true"),
            allow_nested_pools: false,
        });
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.timeout, Duration::from_secs(54_000));
        assert!(!config.suppress_worker_failures);
        assert_eq!(config.max_tasks_per_worker, None);
    }

    #[test]
    fn test_empty_run_spawns_nothing() {
        let config = WorkerPoolConfig::new(WorkerConfig {
            program: PathBuf::from("/nonexistent/worker"),
            allow_nested_pools: false,
        });
        assert!(WorkerPool::run(config, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_live_table_refuses_after_abort() {
        let shared = Shared::new(tasks(2), 2);
        assert!(shared.register(0, Pid::from_raw(i32::MAX)));
        assert_eq!(shared.live_count(), 1);
        shared.unregister(0);
        assert_eq!(shared.live_count(), 0);

        assert_eq!(shared.begin_abort(Signal::SIGTERM), 0);
        assert!(!shared.register(1, Pid::from_raw(i32::MAX)));
        assert!(shared.next_task().is_none());
    }

    #[test]
    fn test_first_fatal_error_wins() {
        let shared = Shared::new(Vec::new(), 1);
        shared.fail(JobError::Pool("first".into()));
        shared.fail(JobError::Pool("second".into()));
        assert!(shared.take_fatal().unwrap().to_string().contains("first"));
        assert!(shared.take_fatal().is_none());
    }

    #[test]
    fn test_scripted_worker_success() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let worker = script(
            dir.path(),
            "answer",
            &format!("{}\nwhile read line; do {}; done", READY, ANSWER_SEVEN),
        );

        let outcomes = WorkerPool::run(WorkerPoolConfig::new(worker), tasks(1)).unwrap();
        assert_eq!(outcomes, vec![TaskOutcome::Success(json!(7))]);
    }

    #[test]
    fn test_worker_death_is_reported() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let worker = script(dir.path(), "dies", &format!("{}\nread line\nexit 3", READY));

        let mut config = WorkerPoolConfig::new(worker.clone());
        config.suppress_worker_failures = true;
        let outcomes = WorkerPool::run(config, tasks(2)).unwrap();
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            let failure = outcome.failure().expect("worker death is a failure");
            assert_eq!(failure.kind, WORKER_DIED);
            assert!(failure.message.contains("exited with code 3"));
        }

        let err = WorkerPool::run(WorkerPoolConfig::new(worker), tasks(1)).unwrap_err();
        match err {
            JobError::Worker { index, failure } => {
                assert_eq!(index, 0);
                assert_eq!(failure.kind, WORKER_DIED);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_timeout_terminates_pool() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let worker = script(dir.path(), "hangs", &format!("{}\nexec sleep 60", READY));

        let mut config = WorkerPoolConfig::new(worker);
        config.timeout = Duration::from_millis(200);
        let start = Instant::now();
        let err = WorkerPool::run(config, tasks(3)).unwrap_err();
        assert!(matches!(err, JobError::Timeout { index: 0, .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_spawn_failure_is_fatal() {
        let _lock = test_lock();
        let config = WorkerPoolConfig::new(WorkerConfig {
            program: PathBuf::from("/nonexistent/worker"),
            allow_nested_pools: false,
        });
        let err = WorkerPool::run(config, tasks(2)).unwrap_err();
        assert!(matches!(err, JobError::Pool(_)));
    }

    /// Send SIGINT to this process once `marker` exists.
    fn interrupt_when(marker: PathBuf) -> std::thread::JoinHandle<bool> {
        std::thread::spawn(move || {
            let start = Instant::now();
            while !marker.exists() {
                if start.elapsed() > Duration::from_secs(20) {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            signal::kill(Pid::this(), Signal::SIGINT).is_ok()
        })
    }

    #[test]
    fn test_interrupt_during_shutdown_is_reported() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let answered = dir.path().join("answered");
        // Answers its one task, then sits on the exit request.
        let worker = script(
            dir.path(),
            "slow-exit",
            &format!(
                "{}\nread line\n{}\ntouch {}\nread line\nexec sleep 30",
                READY,
                ANSWER_SEVEN,
                answered.display()
            ),
        );

        let interrupter = interrupt_when(answered);
        let start = Instant::now();
        let result = WorkerPool::run(WorkerPoolConfig::new(worker), tasks(1));
        assert!(interrupter.join().unwrap(), "worker never answered");
        assert!(
            matches!(result, Err(JobError::Interrupted)),
            "unexpected result {:?}",
            result
        );
        assert!(start.elapsed() < STOP_TIMEOUT);
    }

    #[test]
    fn test_interrupt_during_startup_is_deferred() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let started = dir.path().join("started");
        // Never becomes ready.
        let worker = script(
            dir.path(),
            "slow-start",
            &format!("touch {}
exec sleep 30", started.display()),
        );

        let interrupter = interrupt_when(started);
        let start = Instant::now();
        let result = WorkerPool::run(WorkerPoolConfig::new(worker), tasks(2));
        assert!(interrupter.join().unwrap(), "worker never started");
        assert!(
            matches!(result, Err(JobError::Interrupted)),
            "unexpected result {:?}",
            result
        );
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_protocol_violation_is_fatal() {
        let _lock = test_lock();
        let dir = tempfile::tempdir().unwrap();
        let worker = script(
            dir.path(),
            "confused",
            &format!("{}\nwhile read line; do {}; done", READY, READY),
        );
        let err = WorkerPool::run(WorkerPoolConfig::new(worker), tasks(1)).unwrap_err();
        assert!(err.to_string().contains("unexpected response"));
    }
}
