//! procjob - process-pool job runner
//!
//! Applies a named function to every item of a batch, either in the calling process
//! or on a pool of worker processes, and returns one result per item in submission
//! order. Ctrl+C during a pool run terminates every worker before the interrupt is
//! reported to the caller.
//!
//! Workers are the host program itself, re-executed in worker mode, so `main` must
//! hand over to [`run_if_worker`] before doing anything else:
//!
//! ```no_run
//! use procjob::{Job, JobConfig, Registry, TaskError};
//! use serde_json::Value;
//!
//! fn registry() -> Registry {
//!     let mut registry = Registry::new();
//!     registry.register("square", |x: i64, _args: &[Value]| Ok::<_, TaskError>(x * x));
//!     registry
//! }
//!
//! fn main() {
//!     let registry = registry();
//!     procjob::run_if_worker(&registry);
//!
//!     let squares: Vec<Option<i64>> = Job::new(registry, "square")
//!         .with_items(1..=10)
//!         .with_config(JobConfig::default().with_env_overrides())
//!         .run_multi_processed()
//!         .unwrap();
//!     println!("{:?}", squares);
//! }
//! ```

pub mod builtins;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod job;
pub mod logging;
pub mod outputs;
pub mod pool;
pub mod registry;
pub mod task;

pub use config::JobConfig;
pub use error::{JobError, Result, TaskError};
pub use job::Job;
pub use pool::run_if_worker;
pub use registry::Registry;
pub use task::TaskOutcome;
