//! Worker process pool.
//!
//! A pool is a fixed number of worker slots, each served by a dispatcher thread in the
//! controlling process and backed by one worker subprocess. Workers are the host
//! program re-executed in worker mode; they exchange newline-delimited JSON with their
//! dispatcher over stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │    Controller    │  waits in submission order,
//!                     │ (InterruptGuard) │  applies failure policy
//!                     └────────┬─────────┘
//!                              │ outcomes (index-tagged)
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//!         │ dispatch 0 │ │ dispatch 1 │ │ dispatch N │  threads
//!         └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!               │ pipes        │              │
//!         ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//!         │  worker 0  │ │  worker 1  │ │  worker N  │  processes
//!         └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! # Features
//!
//! - **Interrupt propagation**: Ctrl+C reaches only the controller, which terminates
//!   every worker before reporting the interrupt
//! - **Crash recovery**: a worker that dies mid-task fails that task and is respawned
//! - **Recycling**: workers can be replaced after a fixed number of tasks
//! - **Daemon workers**: by default workers may not start pools of their own and are
//!   killed with their parent (Linux)

mod controller;
mod ipc;
mod proc;
mod protocol;
mod spawn;
mod termination;
pub mod worker_main;

pub use controller::{DEFAULT_TIMEOUT, PoolStats, WorkerPool, WorkerPoolConfig};
pub use spawn::{NESTED_POOLS_ENV, WORKER_ENV, WorkerConfig};
pub use termination::WORKER_DIED;
pub use worker_main::{is_worker_process, nested_pools_allowed, run_if_worker};
