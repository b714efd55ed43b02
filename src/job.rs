//! Job façade: validate a batch, then run it in-process or on a worker pool.

use crate::config::JobConfig;
use crate::error::{JobError, Result};
use crate::outputs::{InProcessOutputs, OutputSink};
use crate::pool::{self, WorkerConfig, WorkerPool, WorkerPoolConfig};
use crate::registry::Registry;
use crate::task::{Task, TaskOutcome};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// A batch: one function applied to every item, with fixed extra arguments.
///
/// ```no_run
/// use procjob::{Job, JobConfig, builtins};
///
/// let results: Vec<Option<i64>> = Job::new(builtins::registry(), "plus_one")
///     .with_items([1, 2, 3])
///     .with_config(JobConfig::default().with_processes(2))
///     .run_multi_processed()
///     .unwrap();
/// assert_eq!(results, vec![Some(2), Some(3), Some(4)]);
/// ```
#[derive(Debug, Clone)]
pub struct Job {
    registry: Arc<Registry>,
    func: String,
    items: Vec<Value>,
    args: Vec<Value>,
    config: JobConfig,
    /// First item or argument that failed to serialize; reported by every run.
    invalid: Option<String>,
}

impl Job {
    pub fn new(registry: impl Into<Arc<Registry>>, func: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            func: func.into(),
            items: Vec::new(),
            args: Vec::new(),
            config: JobConfig::default(),
            invalid: None,
        }
    }

    /// Append items, in submission order.
    pub fn with_items<T, I>(mut self, items: I) -> Self
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        for item in items {
            let position = self.items.len();
            match serde_json::to_value(item) {
                Ok(value) => self.items.push(value),
                Err(e) => {
                    self.record_invalid(format!("item {} is not serializable: {}", position, e))
                }
            }
        }
        self
    }

    /// Append one extra argument, passed after the item on every call.
    pub fn with_arg<T: Serialize>(mut self, arg: T) -> Self {
        let position = self.args.len();
        match serde_json::to_value(arg) {
            Ok(value) => self.args.push(value),
            Err(e) => {
                self.record_invalid(format!("argument {} is not serializable: {}", position, e))
            }
        }
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    fn record_invalid(&mut self, message: String) {
        if self.invalid.is_none() {
            self.invalid = Some(message);
        }
    }

    /// Run sequentially in this process; failures become `None` when suppressed.
    pub fn run_single_processed<R: DeserializeOwned>(&self) -> Result<Vec<Option<R>>> {
        typed(self.run_single_outcomes()?)
    }

    /// Run on a pool of worker processes; failures become `None` when suppressed.
    pub fn run_multi_processed<R: DeserializeOwned>(&self) -> Result<Vec<Option<R>>> {
        typed(self.run_multi_outcomes()?)
    }

    /// Like [`run_single_processed`](Self::run_single_processed), keeping failure details.
    #[instrument(level = "debug", skip_all, fields(func = %self.func, items = self.items.len()))]
    pub fn run_single_outcomes(&self) -> Result<Vec<TaskOutcome>> {
        self.validate()?;
        let started = self.log_start("single");

        let mut outputs = InProcessOutputs::with_capacity(self.items.len());
        for task in self.tasks() {
            let outcome = task.execute(&self.registry);
            if let TaskOutcome::Failed(failure) = &outcome
                && !self.config.suppress_worker_failures
            {
                return Err(JobError::Worker {
                    index: task.index,
                    failure: failure.clone(),
                });
            }
            outputs.add(task.index, outcome);
        }

        self.log_finish(started);
        Ok(outputs.into_outcomes())
    }

    /// Like [`run_multi_processed`](Self::run_multi_processed), keeping failure details.
    #[instrument(level = "debug", skip_all, fields(func = %self.func, items = self.items.len()))]
    pub fn run_multi_outcomes(&self) -> Result<Vec<TaskOutcome>> {
        self.validate()?;
        if !pool::nested_pools_allowed() {
            return Err(JobError::Config(
                "daemonic workers may not create child pools; enable allow_nested_pools on the outer job"
                    .to_string(),
            ));
        }
        if self.items.is_empty() {
            return Ok(Vec::new());
        }

        let started = self.log_start("multi");
        let worker = match &self.config.worker_program {
            Some(program) => WorkerConfig {
                program: program.clone(),
                allow_nested_pools: self.config.allow_nested_pools,
            },
            None => WorkerConfig::current_exe(self.config.allow_nested_pools)?,
        };
        let pool_config = WorkerPoolConfig {
            worker_count: self.config.processes,
            timeout: self.config.timeout,
            suppress_worker_failures: self.config.suppress_worker_failures,
            max_tasks_per_worker: self.config.max_tasks_per_worker,
            worker,
        };

        let outcomes = WorkerPool::run(pool_config, self.tasks().collect())?;
        self.log_finish(started);
        Ok(outcomes)
    }

    fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(index, item)| Task::new(index, self.func.clone(), item.clone(), self.args.clone()))
    }

    /// Everything that can be checked before a worker exists.
    fn validate(&self) -> Result<()> {
        if self.config.processes == 0 {
            return Err(JobError::Config("processes must be at least 1".to_string()));
        }
        if self.config.max_tasks_per_worker == Some(0) {
            return Err(JobError::Config(
                "max_tasks_per_worker must be at least 1".to_string(),
            ));
        }
        if let Some(message) = &self.invalid {
            return Err(JobError::Config(message.clone()));
        }

        let function = self.registry.get(&self.func).ok_or_else(|| {
            JobError::Config(format!("no function registered as '{}'", self.func))
        })?;
        for (index, item) in self.items.iter().enumerate() {
            function.accepts(item).map_err(|e| {
                JobError::Config(format!(
                    "item {} ({}) is not a valid input for '{}': {}",
                    index, item, self.func, e
                ))
            })?;
        }
        Ok(())
    }

    fn log_start(&self, mode: &str) -> Instant {
        if self.config.debug {
            info!(
                func = %self.func,
                mode,
                items = self.items.len(),
                processes = self.config.processes,
                "Job started"
            );
        }
        Instant::now()
    }

    fn log_finish(&self, started: Instant) {
        if self.config.debug {
            info!(
                func = %self.func,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job finished"
            );
        }
    }
}

fn typed<R: DeserializeOwned>(outcomes: Vec<TaskOutcome>) -> Result<Vec<Option<R>>> {
    outcomes.into_iter().map(TaskOutcome::into_typed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use proptest::prelude::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("plus_two", |x: i64, _args: &[Value]| Ok::<_, TaskError>(x + 2))
            .register("fail_on", |x: i64, args: &[Value]| -> std::result::Result<i64, TaskError> {
                let bad: i64 = crate::task::arg(args, 0)?;
                if x == bad {
                    Err(TaskError::new("ValueError", format!("refusing {}", x)))
                } else {
                    Ok(x)
                }
            })
            .register("panics", |_x: i64, _args: &[Value]| -> std::result::Result<i64, TaskError> {
                panic!("boom")
            });
        registry
    }

    #[test]
    fn test_single_plus_two() {
        let results: Vec<Option<i64>> = Job::new(registry(), "plus_two")
            .with_items([1, 2, 3])
            .run_single_processed()
            .unwrap();
        assert_eq!(results, vec![Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn test_single_suppressed_failure_marker() {
        let results: Vec<Option<i64>> = Job::new(registry(), "fail_on")
            .with_items([1, 2, 3])
            .with_arg(3)
            .with_config(JobConfig::default().with_suppress_worker_failures(true))
            .run_single_processed()
            .unwrap();
        assert_eq!(results, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn test_single_failure_propagates() {
        let err = Job::new(registry(), "fail_on")
            .with_items([1, 2, 3])
            .with_arg(2)
            .run_single_processed::<i64>()
            .unwrap_err();
        match err {
            JobError::Worker { index, failure } => {
                assert_eq!(index, 1);
                assert_eq!(failure, TaskError::new("ValueError", "refusing 2"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_single_panic_is_failure() {
        let outcomes = Job::new(registry(), "panics")
            .with_items([1])
            .with_config(JobConfig::default().with_suppress_worker_failures(true))
            .run_single_outcomes()
            .unwrap();
        assert_eq!(outcomes[0].failure().map(|f| f.kind.as_str()), Some("panic"));
    }

    #[test]
    fn test_runs_are_repeatable() {
        let job = Job::new(registry(), "plus_two").with_items([5, 6]);
        let first: Vec<Option<i64>> = job.run_single_processed().unwrap();
        let second: Vec<Option<i64>> = job.run_single_processed().unwrap();
        assert_eq!(first, second);
        assert_eq!(job.items().len(), 2);
    }

    #[test]
    fn test_jobs_do_not_share_containers() {
        let a = Job::new(registry(), "plus_two").with_items([1]).with_arg(9);
        let b = Job::new(registry(), "plus_two");
        assert_eq!(a.items().len(), 1);
        assert_eq!(a.args().len(), 1);
        assert!(b.items().is_empty());
        assert!(b.args().is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let zero = Job::new(registry(), "plus_two")
            .with_items([1])
            .with_config(JobConfig::default().with_processes(0));
        assert!(matches!(zero.run_multi_outcomes(), Err(JobError::Config(_))));

        let unknown = Job::new(registry(), "nope").with_items([1]);
        let err = unknown.run_single_outcomes().unwrap_err();
        assert!(err.to_string().contains("no function registered as 'nope'"));

        let wrong_type = Job::new(registry(), "plus_two").with_items(["x"]);
        let err = wrong_type.run_multi_outcomes().unwrap_err();
        assert!(matches!(err, JobError::Config(_)));
        assert!(err.to_string().contains("item 0"));

        let recycle_zero = Job::new(registry(), "plus_two")
            .with_items([1])
            .with_config(JobConfig::default().with_max_tasks_per_worker(Some(0)));
        assert!(matches!(recycle_zero.run_single_outcomes(), Err(JobError::Config(_))));
    }

    #[test]
    fn test_unserializable_item_rejected() {
        use std::collections::HashMap;
        // Non-string map keys cannot become JSON.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let job = Job::new(registry(), "plus_two").with_items([bad]);
        let err = job.run_single_outcomes().unwrap_err();
        assert!(err.to_string().contains("not serializable"));
    }

    #[test]
    fn test_multi_empty_items_is_noop() {
        let job = Job::new(registry(), "plus_two")
            .with_config(JobConfig::default().with_worker_program("/nonexistent/worker"));
        assert!(job.run_multi_outcomes().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_single_preserves_order(items in proptest::collection::vec(-1000i64..1000, 0..40)) {
            let results: Vec<Option<i64>> = Job::new(registry(), "plus_two")
                .with_items(items.clone())
                .run_single_processed()
                .unwrap();
            let expected: Vec<Option<i64>> = items.iter().map(|x| Some(x + 2)).collect();
            prop_assert_eq!(results, expected);
        }
    }
}
