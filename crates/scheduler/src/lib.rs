//! The hive scheduler: global authority over task state, placement and
//! replica locations.
//!
//! [`SchedulerState`] is a synchronous state machine: every external event
//! (client submission or release, worker report, worker departure) is fed to
//! one of its handlers, which runs a batch of transitions and leaves the
//! resulting worker and client messages in an outbox. [`SchedulerServer`]
//! drives it from a single tokio task, so task and worker state is never
//! shared or locked.

pub mod error;
pub mod handlers;
pub mod placement;
pub mod server;
pub mod state;
pub mod transitions;
pub mod validate;

#[cfg(test)]
mod tests;

pub use error::SchedulerError;
pub use server::{SchedulerHandle, SchedulerServer};
pub use state::{ClientState, Outbox, SchedulerState, TaskState, TransitionRecord, WorkerState};
