//! Messages exchanged between the controller and a worker process.
//!
//! One JSON document per line; see [`super::ipc`].

use crate::task::{Task, TaskOutcome};
use serde::{Deserialize, Serialize};

/// Request from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Execute one task.
    Run { task: Task },

    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Worker is up and waiting for its first task.
    Ready { pid: u32 },

    /// Outcome of the task with submission index `index`.
    Outcome { index: usize, outcome: TaskOutcome },

    /// The worker could not make sense of a request.
    Error { message: String },
}

impl WorkRequest {
    pub fn run(task: Task) -> Self {
        Self::Run { task }
    }
}

impl WorkResponse {
    pub fn ready() -> Self {
        Self::Ready {
            pid: std::process::id(),
        }
    }

    pub fn outcome(index: usize, outcome: TaskOutcome) -> Self {
        Self::Outcome { index, outcome }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
