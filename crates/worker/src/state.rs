//! Worker-side bookkeeping of one task.

use std::collections::{BTreeMap, BTreeSet};

use hive_core::{Address, RunSpec, TaskError, TaskKey, TaskPriority, WorkerTaskStatus};

/// What a worker knows about one key: a task it was asked to compute, a
/// dependency it fetches from peers, or both in turn.
#[derive(Debug, Clone)]
pub struct WorkerTaskState {
    pub key: TaskKey,
    pub state: WorkerTaskStatus,
    /// Present for tasks the scheduler asked this worker to compute.
    pub run_spec: Option<RunSpec>,
    pub priority: TaskPriority,

    pub dependencies: BTreeSet<TaskKey>,
    pub dependents: BTreeSet<TaskKey>,
    /// Dependencies not yet in local memory.
    pub waiting_for_data: BTreeSet<TaskKey>,

    /// Peers believed to hold the key.
    pub candidate_sources: BTreeSet<Address>,
    /// Peer the key is being transferred from; only set in flight (or a
    /// cancelled/resumed flight).
    pub active_source: Option<Address>,

    pub nbytes: Option<u64>,
    pub resource_restrictions: BTreeMap<String, f64>,
    pub exception: Option<TaskError>,

    /// For `cancelled` and `resumed`: the state whose work is still in
    /// progress (`flight`, `executing` or `long-running`).
    pub previous: Option<WorkerTaskStatus>,
    /// For `resumed`: where the key goes if that work does not produce data.
    pub next: Option<WorkerTaskStatus>,
}

impl WorkerTaskState {
    pub fn new(key: TaskKey, priority: TaskPriority) -> Self {
        Self {
            key,
            state: WorkerTaskStatus::Released,
            run_spec: None,
            priority,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            waiting_for_data: BTreeSet::new(),
            candidate_sources: BTreeSet::new(),
            active_source: None,
            nbytes: None,
            resource_restrictions: BTreeMap::new(),
            exception: None,
            previous: None,
            next: None,
        }
    }

    /// User code for this key is still running, whatever its state says.
    pub fn is_executing(&self) -> bool {
        self.state.is_running() || self.previous.is_some_and(WorkerTaskStatus::is_running)
    }

    /// A transfer of this key is still in progress.
    pub fn is_in_flight(&self) -> bool {
        self.state == WorkerTaskStatus::Flight || self.previous == Some(WorkerTaskStatus::Flight)
    }
}

/// One applied worker transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTransition {
    pub key: TaskKey,
    pub start: WorkerTaskStatus,
    pub finish: WorkerTaskStatus,
    pub stimulus_id: String,
}
