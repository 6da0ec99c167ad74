use std::time::Duration;

use hive_comm::CommError;
use hive_core::{HiveError, TaskError, TaskKey};
use hive_scheduler::SchedulerError;
use hive_worker::WorkerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("comm error: {0}")]
    Comm(#[from] CommError),

    #[error(transparent)]
    Hive(#[from] HiveError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// The task raised; carried verbatim from the worker.
    #[error("{0}")]
    Task(TaskError),

    #[error("future {0} was cancelled")]
    Cancelled(TaskKey),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("result of {0} is finished but no worker could deliver it")]
    Unavailable(TaskKey),

    #[error("unsupported arguments to executor: {0:?}")]
    UnsupportedOptions(Vec<String>),

    #[error("invalid executor option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("executor is shut down")]
    ExecutorShutdown,

    #[error("client is closed")]
    Closed,

    #[error("restart finished with {workers} of {expected} workers")]
    RestartIncomplete { workers: usize, expected: usize },

    #[error("unexpected scheduler reply: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// The user exception, if this error carries one.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            ClientError::Task(e) => Some(e),
            _ => None,
        }
    }
}
