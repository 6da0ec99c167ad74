use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::key::TaskKey;

/// An exception raised by user task code, carried verbatim to every Future
/// that depends on the failing task.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{type_name}: {message}")]
pub struct TaskError {
    /// Exception class, e.g. `ZeroDivisionError` or `KilledWorker`.
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Bad arguments passed to a task function.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Task code panicked.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("Panic", message)
    }

    /// The task was on too many workers that died while running it.
    pub fn killed_worker(key: &TaskKey, worker: &Address, failures: u32) -> Self {
        Self::new(
            "KilledWorker",
            format!("attempted to run task {key} on {failures} different workers, last worker was {worker}"),
        )
    }

    /// A dependency can no longer be produced.
    pub fn lost_dependency(key: &TaskKey, dependency: &TaskKey) -> Self {
        Self::new(
            "LostDependency",
            format!("task {key} depends on {dependency}, which has no data and no way to compute it"),
        )
    }

    /// A placeholder task has no replica left and no recipe to recompute it.
    pub fn lost_data(key: &TaskKey) -> Self {
        Self::new(
            "LostData",
            format!("no replica of {key} exists and it cannot be recomputed"),
        )
    }

    /// The task function is not known on the worker.
    pub fn unknown_function(name: &str) -> Self {
        Self::new("LookupError", format!("function '{name}' is not registered"))
    }

    pub fn is_killed_worker(&self) -> bool {
        self.type_name == "KilledWorker"
    }
}

/// Errors from configuration and function registration.
#[derive(Debug, Error)]
pub enum HiveError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("function '{0}' is already registered with a different body")]
    FunctionConflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display_includes_type() {
        let e = TaskError::new("ZeroDivisionError", "one");
        assert_eq!(e.to_string(), "ZeroDivisionError: one");
    }

    #[test]
    fn killed_worker_is_recognised() {
        let e = TaskError::killed_worker(&TaskKey::new("x"), &Address::inproc("w"), 4);
        assert!(e.is_killed_worker());
        assert!(e.message.contains("4 different workers"));
    }
}
