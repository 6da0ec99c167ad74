//! Task functions and the registry workers resolve them from.
//!
//! Run specifications only carry a function *name*; the body lives in a
//! [`FunctionRegistry`] shared by every component of an in-process cluster,
//! standing in for code that would otherwise be shipped to workers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::error::{HiveError, TaskError};
use crate::key::TaskKey;

/// Outcome of a task function.
pub type TaskResult = Result<Value, TaskError>;

type TaskBody = dyn Fn(&TaskCall) -> TaskResult + Send + Sync;

/// A named task function.
///
/// The name is the function's identity for pure-key derivation, so two
/// different bodies must never share a name within one cluster.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    body: Arc<TaskBody>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskCall) -> TaskResult + Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, call: &TaskCall) -> TaskResult {
        (self.body)(call)
    }

    fn same_body(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}

/// Name → function lookup shared by clients and workers.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, Function>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function`. Re-registering the same function is a no-op.
    pub fn register(&self, function: &Function) -> Result<(), HiveError> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match functions.get(function.name()) {
            Some(existing) if existing.same_body(function) => Ok(()),
            Some(_) => Err(HiveError::FunctionConflict(function.name().to_string())),
            None => {
                functions.insert(function.name().to_string(), function.clone());
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.len())
            .finish()
    }
}

/// Resolved arguments handed to a running task function.
///
/// Top-level dependency arguments are shared `Arc`s of the worker's stored
/// data: every concurrently executing consumer reads the same value.
pub struct TaskCall {
    key: TaskKey,
    args: Vec<Arc<Value>>,
    kwargs: BTreeMap<String, Arc<Value>>,
    seceder: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TaskCall {
    pub fn new(key: TaskKey, args: Vec<Arc<Value>>, kwargs: BTreeMap<String, Arc<Value>>) -> Self {
        Self {
            key,
            args,
            kwargs,
            seceder: None,
        }
    }

    /// Install the hook invoked by [`TaskCall::secede`].
    pub fn with_seceder(mut self, seceder: impl Fn() + Send + Sync + 'static) -> Self {
        self.seceder = Some(Box::new(seceder));
        self
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn args(&self) -> &[Arc<Value>] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Result<&Value, TaskError> {
        self.args
            .get(index)
            .map(|v| v.as_ref())
            .ok_or_else(|| TaskError::argument(format!("missing positional argument {index}")))
    }

    pub fn arg_i64(&self, index: usize) -> Result<i64, TaskError> {
        let v = self.arg(index)?;
        v.as_i64()
            .ok_or_else(|| TaskError::argument(format!("argument {index} is not an integer: {v}")))
    }

    pub fn arg_f64(&self, index: usize) -> Result<f64, TaskError> {
        let v = self.arg(index)?;
        v.as_f64()
            .ok_or_else(|| TaskError::argument(format!("argument {index} is not a number: {v}")))
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name).map(|v| v.as_ref())
    }

    /// Keyword argument as a number, or `default` when absent.
    pub fn kwarg_f64_or(&self, name: &str, default: f64) -> Result<f64, TaskError> {
        match self.kwarg(name) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| TaskError::argument(format!("keyword '{name}' is not a number: {v}"))),
        }
    }

    /// Positional argument `index` if present, else keyword `name`.
    pub fn arg_or_kwarg(&self, index: usize, name: &str) -> Result<&Value, TaskError> {
        match self.args.get(index) {
            Some(v) => Ok(v.as_ref()),
            None => self
                .kwarg(name)
                .ok_or_else(|| TaskError::argument(format!("missing argument '{name}'"))),
        }
    }

    /// Tell the worker this task will run for a long time and should not
    /// count against its thread slots or occupancy.
    pub fn secede(&self) {
        if let Some(seceder) = &self.seceder {
            seceder();
        }
    }
}
