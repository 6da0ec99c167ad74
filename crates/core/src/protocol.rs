//! Wire protocol between clients, the scheduler and workers.
//!
//! Each direction has its own enum so a receiver decodes exactly the set of
//! operations it understands. Requests that expect an answer are sent with a
//! correlation id; the answer travels back as a reply envelope carrying a
//! [`SchedulerReply`] or a [`DataResponse`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::TaskError;
use crate::key::TaskKey;
use crate::spec::{RunSpec, TaskSpec};
use crate::status::TaskStatus;

/// Replica locations: key → workers holding it.
pub type WhoHas = BTreeMap<TaskKey, Vec<Address>>;

/// Clients are identified by their endpoint address.
pub type ClientId = Address;

/// Execution order of a task. Lower sorts first; ties are broken by
/// submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskPriority {
    pub user: i64,
    pub generation: u64,
}

impl TaskPriority {
    pub fn new(user: i64, generation: u64) -> Self {
        Self { user, generation }
    }
}

// ─── Client / Worker → Scheduler ───────────────────────────────────────────

/// Operations the scheduler accepts. The sender is taken from the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToScheduler {
    /// Request; answered with [`SchedulerReply::Ack`].
    RegisterClient,
    CloseClient,
    SubmitGraph {
        tasks: Vec<TaskSpec>,
        /// Keys the submitting client holds futures for.
        wanted: Vec<TaskKey>,
        stimulus_id: String,
    },
    ClientReleasesKeys {
        keys: Vec<TaskKey>,
        stimulus_id: String,
    },
    /// Request; the scheduler sends `cancelled-keys` first, then acks.
    CancelKeys {
        keys: Vec<TaskKey>,
        /// Cancel for every client, not only the sender.
        force: bool,
        stimulus_id: String,
    },
    /// Request; answered with [`SchedulerReply::Restarted`].
    Restart { timeout_ms: u64 },
    /// Request; answered with the matching [`SchedulerReply`] variant.
    Query(SchedulerQuery),

    /// Request; answered with [`SchedulerReply::Registered`].
    RegisterWorker {
        nthreads: usize,
        resources: BTreeMap<String, f64>,
    },
    UnregisterWorker { stimulus_id: String },
    Heartbeat { metrics: WorkerMetrics },
    TaskFinished {
        key: TaskKey,
        nbytes: u64,
        duration_ms: u64,
        stimulus_id: String,
    },
    TaskErred {
        key: TaskKey,
        error: TaskError,
        stimulus_id: String,
    },
    /// A peer did not deliver `key`; `errant_worker` should no longer be
    /// considered a holder.
    MissingData {
        key: TaskKey,
        errant_worker: Address,
        stimulus_id: String,
    },
    /// The sender now holds replicas of these keys.
    AddKeys {
        keys: Vec<TaskKey>,
        stimulus_id: String,
    },
    /// Answered asynchronously with [`ToWorker::RefreshWhoHas`].
    RequestWhoHas { keys: Vec<TaskKey> },
    /// The task seceded from its execution slot.
    LongRunning { key: TaskKey, stimulus_id: String },
}

impl ToScheduler {
    pub fn op(&self) -> &'static str {
        match self {
            ToScheduler::RegisterClient => "register-client",
            ToScheduler::CloseClient => "close-client",
            ToScheduler::SubmitGraph { .. } => "submit-graph",
            ToScheduler::ClientReleasesKeys { .. } => "client-releases-keys",
            ToScheduler::CancelKeys { .. } => "cancel-keys",
            ToScheduler::Restart { .. } => "restart",
            ToScheduler::Query(_) => "query",
            ToScheduler::RegisterWorker { .. } => "register-worker",
            ToScheduler::UnregisterWorker { .. } => "unregister-worker",
            ToScheduler::Heartbeat { .. } => "heartbeat",
            ToScheduler::TaskFinished { .. } => "task-finished",
            ToScheduler::TaskErred { .. } => "task-erred",
            ToScheduler::MissingData { .. } => "missing-data",
            ToScheduler::AddKeys { .. } => "add-keys",
            ToScheduler::RequestWhoHas { .. } => "request-who-has",
            ToScheduler::LongRunning { .. } => "long-running",
        }
    }
}

/// Read-only inspection of scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerQuery {
    /// All keys when `None`.
    WhoHas { keys: Option<Vec<TaskKey>> },
    HasWhat,
    Processing,
    TaskStates,
    Workers,
}

/// Per-worker health sample sent with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub executing: usize,
    pub long_running: usize,
    pub ready: usize,
    pub in_memory: usize,
    pub in_flight: usize,
    pub missing: usize,
}

// ─── Scheduler → Worker ────────────────────────────────────────────────────

/// Operations a worker accepts from the scheduler, and `get-data` from peers
/// and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToWorker {
    ComputeTask {
        key: TaskKey,
        run_spec: RunSpec,
        /// Holders of every dependency.
        who_has: WhoHas,
        nbytes: BTreeMap<TaskKey, u64>,
        priority: TaskPriority,
        resources: BTreeMap<String, f64>,
        stimulus_id: String,
    },
    FreeKeys {
        keys: Vec<TaskKey>,
        stimulus_id: String,
    },
    RefreshWhoHas {
        who_has: WhoHas,
        stimulus_id: String,
    },
    /// `address` left the cluster; never fetch from it again.
    WorkerRemoved {
        address: Address,
        stimulus_id: String,
    },
    Terminate { reason: String },
    /// Request; answered with a [`DataResponse`].
    GetData { keys: Vec<TaskKey> },
}

impl ToWorker {
    pub fn op(&self) -> &'static str {
        match self {
            ToWorker::ComputeTask { .. } => "compute-task",
            ToWorker::FreeKeys { .. } => "free-keys",
            ToWorker::RefreshWhoHas { .. } => "refresh-who-has",
            ToWorker::WorkerRemoved { .. } => "worker-removed",
            ToWorker::Terminate { .. } => "terminate",
            ToWorker::GetData { .. } => "get-data",
        }
    }
}

/// Answer to [`ToWorker::GetData`]. Keys the worker does not hold are listed
/// in `missing` instead of failing the whole request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    pub data: BTreeMap<TaskKey, Value>,
    pub missing: Vec<TaskKey>,
}

// ─── Scheduler → Client ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToClient {
    KeyInMemory { key: TaskKey },
    /// `blame` names the task whose user code raised `error`.
    TaskErred {
        key: TaskKey,
        error: TaskError,
        blame: TaskKey,
    },
    CancelledKeys { keys: Vec<TaskKey> },
    /// Every replica of `key` is gone; it is being recomputed.
    LostData { key: TaskKey },
}

impl ToClient {
    pub fn op(&self) -> &'static str {
        match self {
            ToClient::KeyInMemory { .. } => "key-in-memory",
            ToClient::TaskErred { .. } => "task-erred",
            ToClient::CancelledKeys { .. } => "cancelled-keys",
            ToClient::LostData { .. } => "lost-data",
        }
    }
}

// ─── Replies ───────────────────────────────────────────────────────────────

/// Scheduler's view of one worker, as returned by [`SchedulerQuery::Workers`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub address: Address,
    pub nthreads: usize,
    pub resources: BTreeMap<String, f64>,
    pub processing: usize,
    pub occupancy_ms: f64,
    pub memory_keys: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerReply {
    Ack,
    Registered {
        heartbeat_interval_ms: u64,
    },
    Restarted {
        workers: usize,
        expected: usize,
        complete: bool,
    },
    WhoHas(WhoHas),
    HasWhat(BTreeMap<Address, Vec<TaskKey>>),
    Processing(BTreeMap<Address, Vec<TaskKey>>),
    TaskStates(BTreeMap<TaskKey, TaskStatus>),
    Workers(Vec<WorkerInfo>),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_kebab_case() {
        let msg = ToScheduler::MissingData {
            key: TaskKey::new("x"),
            errant_worker: Address::inproc("w"),
            stimulus_id: "s".into(),
        };
        assert_eq!(msg.op(), "missing-data");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("missing-data").is_some());
    }

    #[test]
    fn priorities_order_by_user_then_generation() {
        let urgent = TaskPriority::new(-1, 9);
        let early = TaskPriority::new(0, 1);
        let late = TaskPriority::new(0, 2);
        assert!(urgent < early);
        assert!(early < late);
    }
}
