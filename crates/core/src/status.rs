//! Task lifecycle states on the scheduler and on workers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduler-side state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Released,
    Waiting,
    NoWorker,
    Processing,
    Memory,
    Erred,
    Forgotten,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Released => "released",
            TaskStatus::Waiting => "waiting",
            TaskStatus::NoWorker => "no-worker",
            TaskStatus::Processing => "processing",
            TaskStatus::Memory => "memory",
            TaskStatus::Erred => "erred",
            TaskStatus::Forgotten => "forgotten",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-side state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerTaskStatus {
    Released,
    Waiting,
    Ready,
    Constrained,
    Executing,
    LongRunning,
    Memory,
    Fetch,
    Flight,
    Missing,
    Error,
    Cancelled,
    Resumed,
}

impl WorkerTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTaskStatus::Released => "released",
            WorkerTaskStatus::Waiting => "waiting",
            WorkerTaskStatus::Ready => "ready",
            WorkerTaskStatus::Constrained => "constrained",
            WorkerTaskStatus::Executing => "executing",
            WorkerTaskStatus::LongRunning => "long-running",
            WorkerTaskStatus::Memory => "memory",
            WorkerTaskStatus::Fetch => "fetch",
            WorkerTaskStatus::Flight => "flight",
            WorkerTaskStatus::Missing => "missing",
            WorkerTaskStatus::Error => "error",
            WorkerTaskStatus::Cancelled => "cancelled",
            WorkerTaskStatus::Resumed => "resumed",
        }
    }

    /// States in which the worker is running user code for the task.
    pub fn is_running(self) -> bool {
        matches!(self, WorkerTaskStatus::Executing | WorkerTaskStatus::LongRunning)
    }
}

impl fmt::Display for WorkerTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_names_match_display() {
        let json = serde_json::to_string(&TaskStatus::NoWorker).unwrap();
        assert_eq!(json, "\"no-worker\"");
        assert_eq!(TaskStatus::NoWorker.to_string(), "no-worker");

        let json = serde_json::to_string(&WorkerTaskStatus::LongRunning).unwrap();
        assert_eq!(json, "\"long-running\"");
        assert!(WorkerTaskStatus::LongRunning.is_running());
        assert!(!WorkerTaskStatus::Flight.is_running());
    }
}
