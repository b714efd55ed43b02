//! Job configuration.
//!
//! # Environment Variables
//!
//! - `PROCJOB_PROCESSES` - Number of worker processes
//! - `PROCJOB_TIMEOUT_SECS` - Per-task timeout in seconds (fractions allowed)
//! - `PROCJOB_SUPPRESS_WORKER_FAILURES` - `1`/`true`/`yes` to record failures and go on

use crate::pool::DEFAULT_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of worker processes.
pub const DEFAULT_PROCESSES: usize = 4;

/// Options for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Worker processes to use (at least 1).
    pub processes: usize,
    /// Per-task timeout in the multi-process path.
    pub timeout: Duration,
    /// Record failures as `None`/[`TaskOutcome::Failed`](crate::TaskOutcome::Failed)
    /// instead of aborting.
    pub suppress_worker_failures: bool,
    /// Use non-daemon workers, which may run pools of their own.
    pub allow_nested_pools: bool,
    /// Replace a worker after this many tasks; `Some(1)` gives every task a fresh process.
    pub max_tasks_per_worker: Option<usize>,
    /// Worker executable; defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    /// Log a start/finish pair at info level.
    pub debug: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            processes: DEFAULT_PROCESSES,
            timeout: DEFAULT_TIMEOUT,
            suppress_worker_failures: false,
            allow_nested_pools: false,
            max_tasks_per_worker: None,
            worker_program: None,
            debug: false,
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_suppress_worker_failures(mut self, suppress: bool) -> Self {
        self.suppress_worker_failures = suppress;
        self
    }

    pub fn with_allow_nested_pools(mut self, allow: bool) -> Self {
        self.allow_nested_pools = allow;
        self
    }

    pub fn with_max_tasks_per_worker(mut self, max: Option<usize>) -> Self {
        self.max_tasks_per_worker = max;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Apply environment variable overrides. Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(processes) = env_parsed("PROCJOB_PROCESSES", |v| v.parse::<usize>().ok()) {
            self.processes = processes;
        }
        if let Some(timeout) = env_parsed("PROCJOB_TIMEOUT_SECS", parse_timeout) {
            self.timeout = timeout;
        }
        if let Some(suppress) = env_parsed("PROCJOB_SUPPRESS_WORKER_FAILURES", parse_flag) {
            self.suppress_worker_failures = suppress;
        }
        self
    }
}

fn env_parsed<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let value = std::env::var(name).ok()?;
    let parsed = parse(value.trim());
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %value, "Ignoring invalid environment override");
    }
    parsed
}

/// Seconds as a non-negative, finite number.
pub fn parse_timeout(s: &str) -> Option<Duration> {
    s.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.processes, 4);
        assert_eq!(config.timeout, Duration::from_secs(15 * 3600));
        assert!(!config.suppress_worker_failures);
        assert!(!config.allow_nested_pools);
        assert_eq!(config.max_tasks_per_worker, None);
        assert_eq!(config.worker_program, None);
        assert!(!config.debug);
    }

    #[test]
    fn test_builder() {
        let config = JobConfig::new()
            .with_processes(2)
            .with_timeout(Duration::from_millis(1500))
            .with_suppress_worker_failures(true)
            .with_allow_nested_pools(true)
            .with_max_tasks_per_worker(Some(1))
            .with_worker_program("/usr/bin/env")
            .with_debug(true);

        assert_eq!(config.processes, 2);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(config.suppress_worker_failures);
        assert!(config.allow_nested_pools);
        assert_eq!(config.max_tasks_per_worker, Some(1));
        assert_eq!(config.worker_program, Some(PathBuf::from("/usr/bin/env")));
        assert!(config.debug);
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_timeout("0.25"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("-1"), None);
        assert_eq!(parse_timeout("inf"), None);
        assert_eq!(parse_timeout("soon"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
