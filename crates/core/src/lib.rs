//! Shared vocabulary of the hive cluster: task keys, worker addresses,
//! task specifications, the wire protocol between client, scheduler and
//! workers, user-facing task errors, and cluster configuration.

pub mod address;
pub mod config;
pub mod error;
pub mod function;
pub mod key;
pub mod protocol;
pub mod spec;
pub mod status;

pub use address::Address;
pub use config::{ClientConfig, CommConfig, HiveConfig, SchedulerConfig, WorkerConfig};
pub use error::{HiveError, TaskError};
pub use function::{Function, FunctionRegistry, TaskCall, TaskResult};
pub use key::TaskKey;
pub use protocol::{TaskPriority, ToClient, ToScheduler, ToWorker, WhoHas};
pub use spec::{Arg, Restrictions, RunSpec, TaskSpec};
pub use status::{TaskStatus, WorkerTaskStatus};

/// Generate a fresh stimulus id for a batch of transitions triggered by `origin`.
pub fn stimulus_id(origin: &str) -> String {
    format!("{origin}-{}", chrono::Utc::now().timestamp_micros())
}
