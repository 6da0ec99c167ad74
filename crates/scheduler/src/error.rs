use hive_comm::CommError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("comm error: {0}")]
    Comm(#[from] CommError),

    #[error("inconsistent scheduler state: {0}")]
    Validation(String),
}
