//! Named unit-of-work functions.
//!
//! Closures cannot travel to another process, so jobs refer to functions by name.
//! The controller and every worker build the same [`Registry`]; the controller uses it
//! to validate items up front, workers use it to execute tasks.

use crate::error::TaskError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type CallFn = dyn Fn(Value, &[Value]) -> Result<Value, TaskError> + Send + Sync;
type AcceptsFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A registered function, erased to JSON in and JSON out.
#[derive(Clone)]
pub struct RegisteredFn {
    name: String,
    call: Arc<CallFn>,
    accepts: Arc<AcceptsFn>,
}

impl RegisteredFn {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function on one item plus the extra arguments.
    pub fn call(&self, item: Value, args: &[Value]) -> Result<Value, TaskError> {
        (self.call)(item, args)
    }

    /// Check that `item` decodes into the function's input type.
    pub fn accepts(&self, item: &Value) -> Result<(), String> {
        (self.accepts)(item)
    }
}

impl fmt::Debug for RegisteredFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFn")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Table of functions a job may run.
#[derive(Clone, Default, Debug)]
pub struct Registry {
    functions: BTreeMap<String, RegisteredFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous function with that name.
    ///
    /// The item is decoded into `I`, the return value is encoded from `R`. A decoding
    /// failure is reported as an `InvalidItem` task failure; the function's own errors
    /// keep their type name (or their [`TaskError::kind`]) as failure kind.
    pub fn register<I, R, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        I: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
        F: Fn(I, &[Value]) -> Result<R, E> + Send + Sync + 'static,
    {
        let call = move |item: Value, args: &[Value]| -> Result<Value, TaskError> {
            let input: I = serde_json::from_value(item)
                .map_err(|e| TaskError::new("InvalidItem", e.to_string()))?;
            let output = f(input, args).map_err(|e| TaskError::describe(&e))?;
            serde_json::to_value(output).map_err(|e| TaskError::new("InvalidOutput", e.to_string()))
        };
        let accepts = |item: &Value| -> Result<(), String> {
            serde_json::from_value::<I>(item.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        };

        self.functions.insert(
            name.to_string(),
            RegisteredFn {
                name: name.to_string(),
                call: Arc::new(call),
                accepts: Arc::new(accepts),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredFn> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
