use hive_comm::CommError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("comm error: {0}")]
    Comm(#[from] CommError),

    #[error("execution pool error: {0}")]
    Pool(String),

    #[error("inconsistent worker state: {0}")]
    Validation(String),
}
