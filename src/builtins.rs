//! Functions bundled with the `procjob` binary.
//!
//! They double as demo material for `procjob run` and as the worker-side registry for
//! the crate's own multi-process tests.

use crate::config::JobConfig;
use crate::error::TaskError;
use crate::job::Job;
use crate::registry::Registry;
use crate::task::arg;
use serde_json::Value;
use std::time::Duration;

/// Name and one-line description of every built-in function.
pub const FUNCTIONS: &[(&str, &str)] = &[
    ("identity", "return the item unchanged"),
    ("plus_one", "integer item + 1"),
    ("plus_num", "integer item + first argument"),
    ("fail_on", "integer item, fails with DivisionByZero when it equals the first argument"),
    ("fail_always", "fails for every item"),
    ("sleep_echo", "sleep for the first argument (seconds), then return the item"),
    ("sleep_item", "sleep for the item (seconds), then return it"),
    ("spin", "never returns"),
    ("panic_on", "integer item, panics when it equals the first argument"),
    ("exit_on", "integer item, kills its worker (exit code 3) when it equals the first argument"),
    ("nested_sum", "list of integers, summed by a nested pool running plus_num 0"),
    ("worker_pid", "process id of the process that ran the task"),
];

/// Exit code used by `exit_on`.
pub const EXIT_ON_CODE: i32 = 3;

#[derive(Debug, thiserror::Error)]
#[error("integer division or modulo by zero")]
pub struct DivisionByZero;

/// Registry holding every function in [`FUNCTIONS`].
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("identity", |x: Value, _args: &[Value]| Ok::<_, TaskError>(x))
        .register("plus_one", |x: i64, _args: &[Value]| Ok::<_, TaskError>(x + 1))
        .register("plus_num", |x: i64, args: &[Value]| {
            let n: i64 = arg(args, 0)?;
            Ok::<_, TaskError>(x + n)
        })
        .register("fail_on", |x: i64, args: &[Value]| -> Result<i64, TaskError> {
            let bad: i64 = arg(args, 0)?;
            if x == bad {
                Err(TaskError::describe(&DivisionByZero))
            } else {
                Ok(x)
            }
        })
        .register("fail_always", |x: Value, _args: &[Value]| -> Result<Value, TaskError> {
            Err(TaskError::new("AlwaysFails", format!("refusing {}", x)))
        })
        .register("sleep_echo", |x: Value, args: &[Value]| {
            let secs: f64 = arg(args, 0)?;
            let pause = Duration::try_from_secs_f64(secs)
                .map_err(|e| TaskError::new("InvalidArgument", e.to_string()))?;
            std::thread::sleep(pause);
            Ok::<_, TaskError>(x)
        })
        .register("sleep_item", |secs: f64, _args: &[Value]| {
            let pause = Duration::try_from_secs_f64(secs)
                .map_err(|e| TaskError::new("InvalidItem", e.to_string()))?;
            std::thread::sleep(pause);
            Ok::<_, TaskError>(secs)
        })
        .register("spin", |_x: Value, _args: &[Value]| -> Result<Value, TaskError> {
            loop {
                std::thread::sleep(Duration::from_millis(50));
            }
        })
        .register("panic_on", |x: i64, args: &[Value]| {
            let bad: i64 = arg(args, 0)?;
            if x == bad {
                panic!("panic_on reached {}", x);
            }
            Ok::<_, TaskError>(x)
        })
        .register("exit_on", |x: i64, args: &[Value]| {
            let bad: i64 = arg(args, 0)?;
            if x == bad {
                std::process::exit(EXIT_ON_CODE);
            }
            Ok::<_, TaskError>(x)
        })
        .register("nested_sum", |xs: Vec<i64>, _args: &[Value]| {
            let results: Vec<Option<i64>> = Job::new(self::registry(), "plus_num")
                .with_items(xs)
                .with_arg(0)
                .with_config(JobConfig::default().with_processes(2))
                .run_multi_processed()?;
            Ok::<_, crate::error::JobError>(results.into_iter().flatten().sum::<i64>())
        })
        .register("worker_pid", |_x: Value, _args: &[Value]| {
            Ok::<_, TaskError>(std::process::id())
        });
    registry
}
