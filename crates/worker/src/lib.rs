//! The hive worker: runs tasks the scheduler assigns and fetches their
//! dependencies from peers.
//!
//! [`WorkerStateMachine`] holds all per-key state and is driven by
//! [`WorkerEvent`]s; [`WorkerBuilder`] starts the tokio control loop that
//! feeds it and carries out the [`Instruction`]s it returns.

pub mod error;
pub mod machine;
pub mod peer;
pub mod pool;
pub mod state;
pub mod worker;

pub use error::WorkerError;
pub use machine::{estimate_nbytes, Instruction, WorkerEvent, WorkerStateMachine};
pub use peer::{NetworkPeers, PeerTransport};
pub use pool::ExecutionPool;
pub use state::{WorkerTaskState, WorkerTransition};
pub use worker::{WorkerBuilder, WorkerExit, WorkerHandle};
