//! Error types for procjob.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for a job run.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Task {index} failed: {failure}")]
    Worker { index: usize, failure: TaskError },

    #[error("Task {index} did not finish within {}s", timeout.as_secs_f64())]
    Timeout { index: usize, timeout: Duration },

    #[error("Interrupted; all workers were terminated")]
    Interrupted,

    #[error("Invalid job configuration: {0}")]
    Config(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// The unit-of-work failure behind this error, if there is one.
    pub fn task_failure(&self) -> Option<&TaskError> {
        match self {
            Self::Worker { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Whether this error came from an operator interrupt.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Result type alias for procjob operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// A failure raised by a unit-of-work function.
///
/// `kind` names the failure (an error type name, `panic`, `WorkerDied`, ...) and
/// `message` describes it. This is also what crosses the process boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    /// Create a failure with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Describe an arbitrary error value, using its unqualified type name as the kind.
    ///
    /// A `TaskError` passed in keeps its own kind.
    pub fn describe<E>(err: &E) -> Self
    where
        E: std::fmt::Display + 'static,
    {
        if let Some(task_err) = (err as &dyn std::any::Any).downcast_ref::<TaskError>() {
            return task_err.clone();
        }
        Self::new(short_type_name::<E>(), err.to_string())
    }

    /// Failure recorded for a task whose function panicked.
    pub fn panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new("panic", message)
    }
}

/// `std::any::type_name` without module paths, keeping generic arguments readable.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for ch in full.chars() {
        match ch {
            ':' => segment.clear(),
            '<' | '>' | ',' | ' ' | '&' | '(' | ')' | '[' | ']' | ';' => {
                out.push_str(&segment);
                segment.clear();
                out.push(ch);
            }
            _ => segment.push(ch),
        }
    }
    out.push_str(&segment);
    out
}
