//! The worker's task state machine.
//!
//! [`WorkerStateMachine::handle`] consumes one [`WorkerEvent`] and returns the
//! [`Instruction`]s the runtime must carry out: messages for the scheduler,
//! peer transfers to start or abort, and task executions. The machine never
//! performs I/O itself, so every transition can be driven synchronously.
//!
//! Split into focused submodules:
//! - `compute`: compute requests, the ready queue, execution results, secede
//! - `fetch`: dependency transfers from peers and replica bookkeeping

mod compute;
mod fetch;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use hive_core::protocol::{DataResponse, ToScheduler, WhoHas, WorkerMetrics};
use hive_core::{Address, RunSpec, TaskError, TaskKey, TaskPriority, WorkerConfig, WorkerTaskStatus};
use serde_json::Value;
use tracing::debug;

use crate::error::WorkerError;
use crate::state::{WorkerTaskState, WorkerTransition};

/// Transition records kept for [`WorkerStateMachine::story`].
const STORY_CAPACITY: usize = 10_000;

// ── Events & instructions ───────────────────────────────────────────

/// Everything that can change worker task state.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    ComputeTask {
        key: TaskKey,
        run_spec: RunSpec,
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
    WorkerRemoved {
        address: Address,
        stimulus_id: String,
    },
    GatherSuccess {
        gather_id: u64,
        response: DataResponse,
        stimulus_id: String,
    },
    /// The peer could not be reached within the configured attempts.
    GatherFailed {
        gather_id: u64,
        stimulus_id: String,
    },
    ExecuteSuccess {
        key: TaskKey,
        value: Value,
        duration_ms: u64,
        stimulus_id: String,
    },
    ExecuteFailure {
        key: TaskKey,
        error: TaskError,
        stimulus_id: String,
    },
    Secede {
        key: TaskKey,
        stimulus_id: String,
    },
    RetryMissing {
        stimulus_id: String,
    },
}

impl WorkerEvent {
    pub fn stimulus_id(&self) -> &str {
        match self {
            WorkerEvent::ComputeTask { stimulus_id, .. }
            | WorkerEvent::FreeKeys { stimulus_id, .. }
            | WorkerEvent::RefreshWhoHas { stimulus_id, .. }
            | WorkerEvent::WorkerRemoved { stimulus_id, .. }
            | WorkerEvent::GatherSuccess { stimulus_id, .. }
            | WorkerEvent::GatherFailed { stimulus_id, .. }
            | WorkerEvent::ExecuteSuccess { stimulus_id, .. }
            | WorkerEvent::ExecuteFailure { stimulus_id, .. }
            | WorkerEvent::Secede { stimulus_id, .. }
            | WorkerEvent::RetryMissing { stimulus_id } => stimulus_id,
        }
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Send(ToScheduler),
    /// Fetch `keys` from `worker` and report back with `gather_id`.
    Gather {
        gather_id: u64,
        worker: Address,
        keys: Vec<TaskKey>,
        stimulus_id: String,
    },
    /// Every key of the gather was released; its result will be ignored.
    AbortGather { gather_id: u64 },
    /// Run `function` with fully resolved arguments.
    Execute {
        key: TaskKey,
        function: String,
        args: Vec<Arc<Value>>,
        kwargs: BTreeMap<String, Arc<Value>>,
        stimulus_id: String,
    },
}

/// An outstanding transfer from one peer.
#[derive(Debug, Clone)]
struct InFlight {
    worker: Address,
    keys: Vec<TaskKey>,
}

// ── State machine ───────────────────────────────────────────────────

pub struct WorkerStateMachine {
    address: Address,
    nthreads: usize,
    transfer_limit: usize,
    transfer_batch_keys: usize,

    tasks: HashMap<TaskKey, WorkerTaskState>,
    /// Results held by this worker; shared read-only with running tasks.
    data: HashMap<TaskKey, Arc<Value>>,

    ready: BTreeSet<(TaskPriority, TaskKey)>,
    constrained: BTreeSet<(TaskPriority, TaskKey)>,
    /// Keys in `fetch`, most urgent first.
    data_needed: BTreeSet<(TaskPriority, TaskKey)>,
    missing: BTreeSet<TaskKey>,

    /// Peer → keys it is believed to hold.
    has_what: BTreeMap<Address, BTreeSet<TaskKey>>,
    /// At most one gather per peer.
    in_flight_workers: BTreeMap<Address, u64>,
    gathers: HashMap<u64, InFlight>,
    next_gather_id: u64,

    /// Keys holding an execution slot.
    executing: BTreeSet<TaskKey>,
    /// Seceded keys; still running, no slot.
    long_running: BTreeSet<TaskKey>,
    available_resources: BTreeMap<String, f64>,

    instructions: Vec<Instruction>,
    story: VecDeque<WorkerTransition>,
}

impl WorkerStateMachine {
    pub fn new(address: Address, config: &WorkerConfig) -> Self {
        Self {
            address,
            nthreads: config.nthreads.max(1),
            transfer_limit: config.transfer_limit.max(1),
            transfer_batch_keys: config.transfer_batch_keys.max(1),
            tasks: HashMap::new(),
            data: HashMap::new(),
            ready: BTreeSet::new(),
            constrained: BTreeSet::new(),
            data_needed: BTreeSet::new(),
            missing: BTreeSet::new(),
            has_what: BTreeMap::new(),
            in_flight_workers: BTreeMap::new(),
            gathers: HashMap::new(),
            next_gather_id: 0,
            executing: BTreeSet::new(),
            long_running: BTreeSet::new(),
            available_resources: config.resources.clone(),
            instructions: Vec::new(),
            story: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn task(&self, key: &TaskKey) -> Option<&WorkerTaskState> {
        self.tasks.get(key)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &WorkerTaskState> {
        self.tasks.values()
    }

    pub fn data(&self, key: &TaskKey) -> Option<&Arc<Value>> {
        self.data.get(key)
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_workers.len()
    }

    /// Every recorded transition of `key`, oldest first.
    pub fn story(&self, key: &TaskKey) -> Vec<&WorkerTransition> {
        self.story.iter().filter(|t| &t.key == key).collect()
    }

    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            executing: self.executing.len(),
            long_running: self.long_running.len(),
            ready: self.ready.len() + self.constrained.len(),
            in_memory: self.data.len(),
            in_flight: self.gathers.values().map(|g| g.keys.len()).sum(),
            missing: self.missing.len(),
        }
    }

    /// Copy out the requested results, plus an estimate of their encoded size.
    pub fn get_data(&self, keys: &[TaskKey]) -> (DataResponse, usize) {
        let mut response = DataResponse::default();
        let mut size = 0;
        for key in keys {
            match self.data.get(key) {
                Some(value) => {
                    size += self
                        .tasks
                        .get(key)
                        .and_then(|ts| ts.nbytes)
                        .unwrap_or_else(|| estimate_nbytes(value)) as usize;
                    response.data.insert(key.clone(), Value::clone(value));
                }
                None => response.missing.push(key.clone()),
            }
        }
        (response, size)
    }

    /// Apply one event and return the side effects it requires.
    pub fn handle(&mut self, event: WorkerEvent) -> Vec<Instruction> {
        let stimulus_id = event.stimulus_id().to_string();
        let sid = stimulus_id.as_str();
        match event {
            WorkerEvent::ComputeTask {
                key,
                run_spec,
                who_has,
                nbytes,
                priority,
                resources,
                ..
            } => self.handle_compute_task(key, run_spec, &who_has, &nbytes, priority, resources, sid),
            WorkerEvent::FreeKeys { keys, .. } => {
                for key in &keys {
                    self.release_key(key, sid);
                }
            }
            WorkerEvent::RefreshWhoHas { who_has, .. } => {
                for (key, holders) in &who_has {
                    self.set_sources(key, holders, sid);
                }
            }
            WorkerEvent::WorkerRemoved { address, .. } => self.purge_source(&address, sid),
            WorkerEvent::GatherSuccess {
                gather_id,
                response,
                ..
            } => self.handle_gather_success(gather_id, response, sid),
            WorkerEvent::GatherFailed { gather_id, .. } => self.handle_gather_failed(gather_id, sid),
            WorkerEvent::ExecuteSuccess {
                key,
                value,
                duration_ms,
                ..
            } => self.handle_execute_success(key, value, duration_ms, sid),
            WorkerEvent::ExecuteFailure { key, error, .. } => {
                self.handle_execute_failure(key, error, sid);
            }
            WorkerEvent::Secede { key, .. } => self.handle_secede(key, sid),
            WorkerEvent::RetryMissing { .. } => {
                if !self.missing.is_empty() {
                    let keys = self.missing.iter().cloned().collect();
                    self.send(ToScheduler::RequestWhoHas { keys });
                }
            }
        }
        self.ensure_communicating(sid);
        self.ensure_computing(sid);
        mem::take(&mut self.instructions)
    }

    // ── Shared helpers ──────────────────────────────────────────────

    fn set_state(&mut self, key: &TaskKey, finish: WorkerTaskStatus, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        let start = ts.state;
        if start == finish {
            return;
        }
        ts.state = finish;
        debug!(
            worker = %self.address,
            key = %key,
            start = %start,
            finish = %finish,
            stimulus_id,
            "worker transition"
        );
        if self.story.len() == STORY_CAPACITY {
            self.story.pop_front();
        }
        self.story.push_back(WorkerTransition {
            key: key.clone(),
            start,
            finish,
            stimulus_id: stimulus_id.to_string(),
        });
    }

    fn send(&mut self, msg: ToScheduler) {
        self.instructions.push(Instruction::Send(msg));
    }

    fn ensure_task(&mut self, key: &TaskKey, priority: TaskPriority) {
        self.tasks
            .entry(key.clone())
            .or_insert_with(|| WorkerTaskState::new(key.clone(), priority));
    }

    /// The scheduler no longer needs `key` here.
    ///
    /// Work already in progress cannot be interrupted: a running or in-flight
    /// key becomes `cancelled` and its result is discarded when it arrives.
    fn release_key(&mut self, key: &TaskKey, stimulus_id: &str) {
        use WorkerTaskStatus::*;

        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        let entry = (ts.priority, key.clone());
        let state = ts.state;
        match state {
            Executing | LongRunning | Flight | Resumed => {
                if state != Resumed {
                    ts.previous = Some(state);
                }
                ts.next = None;
                let source = ts.active_source.clone();
                self.set_state(key, Cancelled, stimulus_id);
                if let Some(source) = source {
                    self.maybe_abort_gather(&source, stimulus_id);
                }
                return;
            }
            Cancelled | Released => return,
            Ready => {
                self.ready.remove(&entry);
            }
            Constrained => {
                self.constrained.remove(&entry);
            }
            Fetch => {
                self.data_needed.remove(&entry);
            }
            Missing => {
                self.missing.remove(key);
            }
            Memory => {
                self.data.remove(key);
            }
            Waiting | Error => {}
        }
        self.reset_released(key, stimulus_id);
        if state == Memory {
            self.repend_dependents(key, stimulus_id);
        }
    }

    /// Discard the outcome of cancelled work.
    fn discard(&mut self, key: &TaskKey, stimulus_id: &str) {
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.previous = None;
            ts.next = None;
            ts.active_source = None;
        }
        self.reset_released(key, stimulus_id);
    }

    /// Move `key` to `released`, unlink it from its dependencies and forget
    /// whatever is no longer referenced.
    fn reset_released(&mut self, key: &TaskKey, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        ts.run_spec = None;
        ts.waiting_for_data.clear();
        ts.exception = None;
        ts.resource_restrictions.clear();
        let dependencies = mem::take(&mut ts.dependencies);
        self.set_state(key, WorkerTaskStatus::Released, stimulus_id);

        for dep in &dependencies {
            if let Some(dts) = self.tasks.get_mut(dep) {
                dts.dependents.remove(key);
            }
            self.maybe_forget(dep, stimulus_id);
        }
        self.maybe_forget(key, stimulus_id);
    }

    /// A key nothing local depends on any more stops being fetched, and is
    /// forgotten once released.
    fn maybe_forget(&mut self, key: &TaskKey, stimulus_id: &str) {
        use WorkerTaskStatus::*;

        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        if !ts.dependents.is_empty() {
            return;
        }
        let entry = (ts.priority, key.clone());
        match ts.state {
            Released => self.forget(key),
            Fetch => {
                self.data_needed.remove(&entry);
                self.forget(key);
            }
            Missing => {
                self.missing.remove(key);
                self.forget(key);
            }
            Flight => {
                ts.previous = Some(Flight);
                let source = ts.active_source.clone();
                self.set_state(key, Cancelled, stimulus_id);
                if let Some(source) = source {
                    self.maybe_abort_gather(&source, stimulus_id);
                }
            }
            Resumed if ts.next == Some(Fetch) => {
                ts.next = None;
                self.set_state(key, Cancelled, stimulus_id);
            }
            _ => {}
        }
    }

    fn forget(&mut self, key: &TaskKey) {
        let Some(ts) = self.tasks.remove(key) else {
            return;
        };
        for source in &ts.candidate_sources {
            if let Some(keys) = self.has_what.get_mut(source) {
                keys.remove(key);
                if keys.is_empty() {
                    self.has_what.remove(source);
                }
            }
        }
        debug!(worker = %self.address, key = %key, "forgotten");
    }

    /// Dependents that have not started yet wait for `key` again after its
    /// data was dropped.
    fn repend_dependents(&mut self, key: &TaskKey, stimulus_id: &str) {
        use WorkerTaskStatus::*;

        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        let pending: Vec<(TaskPriority, TaskKey)> = ts
            .dependents
            .iter()
            .filter_map(|d| self.tasks.get(d))
            .filter(|dts| matches!(dts.state, Waiting | Ready | Constrained))
            .map(|dts| (dts.priority, dts.key.clone()))
            .collect();
        let Some(priority) = pending.iter().map(|(p, _)| *p).min() else {
            return;
        };
        for entry in &pending {
            self.ready.remove(entry);
            self.constrained.remove(entry);
            if let Some(dts) = self.tasks.get_mut(&entry.1) {
                dts.waiting_for_data.insert(key.clone());
            }
            self.set_state(&entry.1, Waiting, stimulus_id);
        }
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.priority = priority;
        }
        self.to_fetch_or_missing(key, stimulus_id);
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Check the internal indexes agree with every task's state.
    pub fn validate(&self) -> Result<(), WorkerError> {
        use WorkerTaskStatus::*;

        let fail = |msg: String| Err(WorkerError::Validation(msg));
        for ts in self.tasks.values() {
            let key = &ts.key;
            let entry = (ts.priority, key.clone());
            let ok = match ts.state {
                Memory => self.data.contains_key(key),
                Ready => self.ready.contains(&entry),
                Constrained => self.constrained.contains(&entry),
                Fetch => self.data_needed.contains(&entry) && !ts.candidate_sources.is_empty(),
                Missing => self.missing.contains(key),
                Waiting => !ts.waiting_for_data.is_empty(),
                Executing => self.executing.contains(key),
                LongRunning => self.long_running.contains(key),
                Flight => ts.active_source.as_ref().is_some_and(|source| {
                    self.in_flight_workers
                        .get(source)
                        .and_then(|id| self.gathers.get(id))
                        .is_some_and(|g| g.keys.contains(key))
                }),
                Cancelled | Resumed => ts.previous.is_some(),
                Released | Error => true,
            };
            if !ok {
                return fail(format!("{key} is {} but its indexes disagree", ts.state));
            }
            for dep in &ts.dependencies {
                let linked = self
                    .tasks
                    .get(dep)
                    .is_some_and(|dts| dts.dependents.contains(key));
                if !linked {
                    return fail(format!("{dep} does not list dependent {key}"));
                }
            }
        }
        for key in self.data.keys() {
            let in_memory = self
                .tasks
                .get(key)
                .is_some_and(|ts| ts.state == Memory);
            if !in_memory {
                return fail(format!("data held for {key} which is not in memory"));
            }
        }
        if self.executing.len() > self.nthreads {
            return fail(format!("{} tasks executing on {} threads", self.executing.len(), self.nthreads));
        }
        if self.in_flight_workers.len() > self.transfer_limit {
            return fail(format!("{} concurrent gathers", self.in_flight_workers.len()));
        }
        Ok(())
    }
}

/// Rough in-memory size of a result, used for transfer accounting.
pub fn estimate_nbytes(value: &Value) -> u64 {
    const OVERHEAD: u64 = 24;
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => OVERHEAD + s.len() as u64,
        Value::Array(items) => OVERHEAD + items.iter().map(estimate_nbytes).sum::<u64>(),
        Value::Object(map) => {
            OVERHEAD
                + map
                    .iter()
                    .map(|(k, v)| k.len() as u64 + estimate_nbytes(v))
                    .sum::<u64>()
        }
    }
}
