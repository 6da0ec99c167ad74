//! Scheduler bookkeeping: tasks, workers, clients and the outbox of
//! messages produced while handling an event.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use hive_core::protocol::{ClientId, ToClient, ToWorker, WorkerInfo, WorkerMetrics};
use hive_core::{
    Address, Restrictions, RunSpec, SchedulerConfig, TaskError, TaskKey, TaskPriority, TaskStatus,
};

/// Transition records kept for [`SchedulerState::story`].
const TRANSITION_LOG_CAPACITY: usize = 10_000;

// ── Tasks ───────────────────────────────────────────────────────────

/// Scheduler-owned state of one task.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub key: TaskKey,
    pub prefix: String,
    /// `None` for a dependency-only placeholder whose data must already exist.
    pub run_spec: Option<RunSpec>,
    pub priority: TaskPriority,
    pub state: TaskStatus,

    pub dependencies: BTreeSet<TaskKey>,
    pub dependents: BTreeSet<TaskKey>,
    /// Dependencies not yet in memory (meaningful while waiting).
    pub waiting_on: BTreeSet<TaskKey>,
    /// Dependents that still need this task's data: those waiting,
    /// no-worker or processing.
    pub waiters: BTreeSet<TaskKey>,

    pub who_wants: BTreeSet<ClientId>,
    pub who_has: BTreeSet<Address>,
    /// Present iff `state == Processing`.
    pub processing_on: Option<Address>,
    /// Workers that reported this task erred and may still hold its error.
    pub erred_on: BTreeSet<Address>,

    /// Never increases.
    pub retries_remaining: u32,
    /// Workers that died while running this task.
    pub suspicious: u32,
    /// Present iff `state == Erred`.
    pub exception: Option<TaskError>,
    pub exception_blame: Option<TaskKey>,

    pub restrictions: Restrictions,
    pub nbytes: Option<u64>,
}

impl TaskState {
    pub fn new(key: TaskKey, run_spec: Option<RunSpec>, priority: TaskPriority) -> Self {
        let prefix = match &run_spec {
            Some(spec) if key.prefix() == key.as_str() => spec.function.clone(),
            _ => key.prefix(),
        };
        Self {
            key,
            prefix,
            run_spec,
            priority,
            state: TaskStatus::Released,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            waiting_on: BTreeSet::new(),
            waiters: BTreeSet::new(),
            who_wants: BTreeSet::new(),
            who_has: BTreeSet::new(),
            processing_on: None,
            erred_on: BTreeSet::new(),
            retries_remaining: 0,
            suspicious: 0,
            exception: None,
            exception_blame: None,
            restrictions: Restrictions::default(),
            nbytes: None,
        }
    }

    /// Someone still needs this task: a client holds a future or a pending
    /// dependent waits for its data.
    pub fn is_needed(&self) -> bool {
        !self.who_wants.is_empty() || !self.waiters.is_empty()
    }
}

/// Running duration statistics of all tasks sharing a key prefix.
#[derive(Debug, Clone, Default)]
pub struct TaskPrefix {
    pub name: String,
    /// Exponentially weighted average, in milliseconds.
    pub duration_average_ms: Option<f64>,
    pub completed: u64,
}

impl TaskPrefix {
    pub fn record(&mut self, duration_ms: f64) {
        self.duration_average_ms = Some(match self.duration_average_ms {
            Some(avg) => 0.5 * avg + 0.5 * duration_ms,
            None => duration_ms,
        });
        self.completed += 1;
    }
}

// ── Workers & clients ───────────────────────────────────────────────

/// The scheduler's view of a worker.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub address: Address,
    pub nthreads: usize,
    /// Resource capacities advertised at registration.
    pub resources: BTreeMap<String, f64>,
    /// Task → estimated duration in milliseconds.
    pub processing: BTreeMap<TaskKey, f64>,
    /// Processing tasks that seceded; they do not count toward occupancy.
    pub long_running: BTreeSet<TaskKey>,
    pub has_what: BTreeSet<TaskKey>,
    /// Estimated remaining work, in milliseconds.
    pub occupancy: f64,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
    pub metrics: WorkerMetrics,
}

impl WorkerState {
    pub fn new(
        address: Address,
        nthreads: usize,
        resources: BTreeMap<String, f64>,
        now: Instant,
    ) -> Self {
        Self {
            address,
            nthreads: nthreads.max(1),
            resources,
            processing: BTreeMap::new(),
            long_running: BTreeSet::new(),
            has_what: BTreeSet::new(),
            occupancy: 0.0,
            last_seen: now,
            last_seen_at: Utc::now(),
            metrics: WorkerMetrics::default(),
        }
    }

    /// Recompute occupancy from the processing set.
    pub fn refresh_occupancy(&mut self) {
        self.occupancy = self
            .processing
            .iter()
            .filter(|(key, _)| !self.long_running.contains(*key))
            .map(|(_, duration)| duration)
            .sum();
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            address: self.address.clone(),
            nthreads: self.nthreads,
            resources: self.resources.clone(),
            processing: self.processing.len(),
            occupancy_ms: self.occupancy,
            memory_keys: self.has_what.len(),
            last_seen: self.last_seen_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientState {
    pub id: ClientId,
    pub wants_what: BTreeSet<TaskKey>,
}

impl ClientState {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            wants_what: BTreeSet::new(),
        }
    }
}

// ── Outbox & log ────────────────────────────────────────────────────

/// Messages produced by a batch of transitions, in emission order.
#[derive(Debug, Default)]
pub struct Outbox {
    pub workers: Vec<(Address, ToWorker)>,
    pub clients: Vec<(ClientId, ToClient)>,
}

impl Outbox {
    pub fn to_worker(&mut self, address: &Address, msg: ToWorker) {
        self.workers.push((address.clone(), msg));
    }

    pub fn to_client(&mut self, client: &ClientId, msg: ToClient) {
        self.clients.push((client.clone(), msg));
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.clients.is_empty()
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub key: TaskKey,
    pub start: TaskStatus,
    pub finish: TaskStatus,
    pub stimulus_id: String,
}

// ── Scheduler state ─────────────────────────────────────────────────

/// All mutable scheduler state. Owned by one control task.
#[derive(Debug)]
pub struct SchedulerState {
    pub(crate) config: SchedulerConfig,
    pub(crate) tasks: HashMap<TaskKey, TaskState>,
    pub(crate) workers: BTreeMap<Address, WorkerState>,
    pub(crate) clients: BTreeMap<ClientId, ClientState>,
    pub(crate) prefixes: HashMap<String, TaskPrefix>,
    /// Tasks in `no-worker`.
    pub(crate) unrunnable: BTreeSet<TaskKey>,
    pub(crate) generation: u64,
    pub(crate) outbox: Outbox,
    pub(crate) log: VecDeque<TransitionRecord>,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            workers: BTreeMap::new(),
            clients: BTreeMap::new(),
            prefixes: HashMap::new(),
            unrunnable: BTreeSet::new(),
            generation: 0,
            outbox: Outbox::default(),
            log: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn task(&self, key: &TaskKey) -> Option<&TaskState> {
        self.tasks.get(key)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks.values()
    }

    pub fn worker(&self, address: &Address) -> Option<&WorkerState> {
        self.workers.get(address)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    pub fn client(&self, id: &ClientId) -> Option<&ClientState> {
        self.clients.get(id)
    }

    pub fn is_client(&self, id: &Address) -> bool {
        self.clients.contains_key(id)
    }

    pub fn prefix(&self, name: &str) -> Option<&TaskPrefix> {
        self.prefixes.get(name)
    }

    /// Drain the messages produced since the last call.
    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    /// Every recorded transition of `key`, oldest first.
    pub fn story(&self, key: &TaskKey) -> Vec<&TransitionRecord> {
        self.log.iter().filter(|r| &r.key == key).collect()
    }

    pub(crate) fn record(
        &mut self,
        key: &TaskKey,
        start: TaskStatus,
        finish: TaskStatus,
        stimulus_id: &str,
    ) {
        if self.log.len() == TRANSITION_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(TransitionRecord {
            key: key.clone(),
            start,
            finish,
            stimulus_id: stimulus_id.to_string(),
        });
    }

    /// Estimated run time of `key`, from its prefix's history.
    pub(crate) fn estimated_duration_ms(&self, key: &TaskKey) -> f64 {
        self.tasks
            .get(key)
            .and_then(|ts| self.prefixes.get(&ts.prefix))
            .and_then(|p| p.duration_average_ms)
            .unwrap_or(self.config.unknown_task_duration_ms as f64)
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}
