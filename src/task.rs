//! Task envelopes and their outcomes.
//!
//! A [`Task`] pairs one input item with the job's function name and fixed extra
//! arguments. It is executed exactly once, either in the caller's process or inside a
//! worker, and always produces exactly one [`TaskOutcome`].

use crate::error::TaskError;
use crate::registry::Registry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// One unit of work: `func(item, args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Submission index of the item this task was built from.
    pub index: usize,
    /// Registered function name.
    pub func: String,
    /// The item being processed.
    pub item: Value,
    /// Extra arguments appended after the item.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Task {
    pub fn new(index: usize, func: impl Into<String>, item: Value, args: Vec<Value>) -> Self {
        Self {
            index,
            func: func.into(),
            item,
            args,
        }
    }

    /// Run the task against `registry`.
    ///
    /// Returned errors and panics both become [`TaskOutcome::Failed`]; either way the
    /// failure is logged here, once, before being handed back for policy handling.
    pub fn execute(&self, registry: &Registry) -> TaskOutcome {
        let result = match registry.get(&self.func) {
            Some(function) => catch_unwind(AssertUnwindSafe(|| {
                function.call(self.item.clone(), &self.args)
            }))
            .unwrap_or_else(|payload| Err(TaskError::panic(payload.as_ref()))),
            None => Err(TaskError::new(
                "UnknownFunction",
                format!("no function registered as '{}'", self.func),
            )),
        };

        match result {
            Ok(value) => TaskOutcome::Success(value),
            Err(failure) => {
                tracing::error!(
                    index = self.index,
                    func = %self.func,
                    item = %self.item,
                    kind = %failure.kind,
                    message = %failure.message,
                    "Task failed"
                );
                TaskOutcome::Failed(failure)
            }
        }
    }
}

/// The recorded result of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(Value),
    Failed(TaskError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::Success(_) => None,
        }
    }

    /// Convert to the caller's result type; failures become the `None` marker.
    pub fn into_typed<R: DeserializeOwned>(self) -> crate::error::Result<Option<R>> {
        match self {
            Self::Success(value) => Ok(Some(serde_json::from_value(value)?)),
            Self::Failed(_) => Ok(None),
        }
    }
}

/// Fetch and decode the extra argument at `index`.
///
/// Meant for use inside unit-of-work functions:
///
/// ```
/// use procjob::task::arg;
/// use serde_json::json;
///
/// let args = vec![json!(2), json!("label")];
/// let addend: i64 = arg(&args, 0).unwrap();
/// assert_eq!(addend, 2);
/// assert!(arg::<i64>(&args, 5).is_err());
/// ```
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, TaskError> {
    let value = args.get(index).ok_or_else(|| {
        TaskError::new(
            "MissingArgument",
            format!("expected an argument at position {}", index),
        )
    })?;
    serde_json::from_value(value.clone()).map_err(|e| {
        TaskError::new(
            "InvalidArgument",
            format!("argument {} ({}) has the wrong shape: {}", index, value, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("double", |x: i64, _args: &[Value]| Ok::<_, TaskError>(x * 2))
            .register("explode", |_x: i64, _args: &[Value]| -> Result<i64, TaskError> {
                panic!("kaboom")
            });
        registry
    }

    #[test]
    fn test_execute_success() {
        let task = Task::new(0, "double", json!(21), vec![]);
        assert_eq!(task.execute(&registry()), TaskOutcome::Success(json!(42)));
    }

    #[test]
    fn test_execute_panic_becomes_failure() {
        let task = Task::new(3, "explode", json!(1), vec![]);
        let outcome = task.execute(&registry());
        let failure = outcome.failure().expect("panic should be a failure");
        assert_eq!(failure.kind, "panic");
        assert_eq!(failure.message, "kaboom");
    }

    #[test]
    fn test_execute_unknown_function() {
        let task = Task::new(0, "missing", json!(1), vec![]);
        let outcome = task.execute(&registry());
        assert_eq!(outcome.failure().unwrap().kind, "UnknownFunction");
    }

    #[test]
    fn test_execute_bad_item_shape() {
        let task = Task::new(0, "double", json!("not a number"), vec![]);
        let outcome = task.execute(&registry());
        assert_eq!(outcome.failure().unwrap().kind, "InvalidItem");
    }

    #[test]
    fn test_outcome_into_typed() {
        let ok: Option<i64> = TaskOutcome::Success(json!(5)).into_typed().unwrap();
        assert_eq!(ok, Some(5));

        let failed: Option<i64> = TaskOutcome::Failed(TaskError::new("E", "m"))
            .into_typed()
            .unwrap();
        assert_eq!(failed, None);

        let wrong: crate::error::Result<Option<i64>> =
            TaskOutcome::Success(json!("five")).into_typed();
        assert!(wrong.is_err());
    }

    #[test]
    fn test_outcome_wire_format() {
        let line = serde_json::to_string(&TaskOutcome::Success(json!(3))).unwrap();
        assert_eq!(line, r#"{"status":"success","value":3}"#);

        let failed = TaskOutcome::Failed(TaskError::new("panic", "oops"));
        let parsed: TaskOutcome =
            serde_json::from_str(&serde_json::to_string(&failed).unwrap()).unwrap();
        assert_eq!(parsed, failed);
    }

    #[test]
    fn test_arg_errors() {
        let args = vec![json!("x")];
        assert_eq!(arg::<i64>(&args, 0).unwrap_err().kind, "InvalidArgument");
        assert_eq!(arg::<i64>(&args, 1).unwrap_err().kind, "MissingArgument");
        assert_eq!(arg::<String>(&args, 0).unwrap(), "x");
    }
}
