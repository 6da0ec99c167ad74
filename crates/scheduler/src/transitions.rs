//! The scheduler's task transition table.
//!
//! A transition mutates one task and returns recommendations: further
//! `(key, target)` transitions it implies. [`SchedulerState::transitions`]
//! applies them until none are left. Transitions that need data from the
//! triggering event (`processing → memory`, `processing → erred`) are called
//! directly by the event handlers and feed their recommendations into the
//! same loop.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use hive_core::protocol::{ToClient, ToWorker, WhoHas};
use hive_core::{Address, TaskError, TaskKey, TaskStatus};
use tracing::debug;

use crate::state::{SchedulerState, TaskPrefix, TaskState};

/// Follow-up transitions, applied in order.
pub type Recommendations = Vec<(TaskKey, TaskStatus)>;

impl SchedulerState {
    /// Apply `recommendations` and everything they lead to.
    pub(crate) fn transitions(&mut self, recommendations: Recommendations, stimulus_id: &str) {
        let mut queue: VecDeque<(TaskKey, TaskStatus)> = recommendations.into();
        while let Some((key, finish)) = queue.pop_front() {
            queue.extend(self.transition(&key, finish, stimulus_id));
        }
    }

    /// Move `key` towards `finish` via the dispatch table.
    ///
    /// Stale recommendations (the task moved on, or was forgotten) are
    /// dropped without effect.
    pub(crate) fn transition(
        &mut self,
        key: &TaskKey,
        finish: TaskStatus,
        stimulus_id: &str,
    ) -> Recommendations {
        use TaskStatus::*;

        let Some(start) = self.tasks.get(key).map(|ts| ts.state) else {
            return Vec::new();
        };
        if start == finish {
            return Vec::new();
        }
        self.logged(key, stimulus_id, |s| match (start, finish) {
            (Released, Waiting) => s.released_waiting(key, stimulus_id),
            (Released, Forgotten) | (Erred, Forgotten) => s.forget(key, stimulus_id),
            (Released, Erred) | (Waiting, Erred) | (NoWorker, Erred) => {
                s.dependency_erred(key, stimulus_id)
            }
            (Waiting, Processing) | (NoWorker, Processing) => s.to_processing(key, stimulus_id),
            (Waiting, NoWorker) => s.waiting_no_worker(key),
            (Waiting, Released) | (NoWorker, Released) => s.waiting_released(key),
            (Processing, Released) => s.processing_released(key, stimulus_id),
            (Memory, Released) => s.memory_released(key, stimulus_id),
            _ => {
                debug!(key = %key, start = %start, finish = %finish, "no transition");
                Vec::new()
            }
        })
    }

    /// Run `f` on `key` and record the state change it caused, if any.
    pub(crate) fn logged<F>(&mut self, key: &TaskKey, stimulus_id: &str, f: F) -> Recommendations
    where
        F: FnOnce(&mut Self) -> Recommendations,
    {
        let start = self.tasks.get(key).map(|ts| ts.state);
        let recs = f(self);
        if let Some(start) = start {
            let finish = self
                .tasks
                .get(key)
                .map_or(TaskStatus::Forgotten, |ts| ts.state);
            if finish != start {
                debug!(key = %key, start = %start, finish = %finish, stimulus_id, "transition");
                self.record(key, start, finish, stimulus_id);
            }
        }
        recs
    }

    // ── Table entries ───────────────────────────────────────────────

    fn released_waiting(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        let Some(ts) = self.tasks.get(key) else {
            return Vec::new();
        };
        if ts.run_spec.is_none() {
            return self.mark_erred(key, TaskError::lost_data(key), key.clone(), stimulus_id);
        }
        let dependencies = ts.dependencies.clone();

        for dep in &dependencies {
            match self.tasks.get(dep) {
                None => {
                    let error = TaskError::lost_dependency(key, dep);
                    return self.mark_erred(key, error, dep.clone(), stimulus_id);
                }
                Some(dts) if dts.state == TaskStatus::Erred => {
                    let (error, blame) = inherited_error(dts);
                    return self.mark_erred(key, error, blame, stimulus_id);
                }
                Some(_) => {}
            }
        }

        let mut recs = Vec::new();
        let mut waiting_on = BTreeSet::new();
        for dep in &dependencies {
            if let Some(dts) = self.tasks.get_mut(dep) {
                dts.waiters.insert(key.clone());
                match dts.state {
                    TaskStatus::Memory => {}
                    TaskStatus::Released => {
                        waiting_on.insert(dep.clone());
                        recs.push((dep.clone(), TaskStatus::Waiting));
                    }
                    _ => {
                        waiting_on.insert(dep.clone());
                    }
                }
            }
        }

        if let Some(ts) = self.tasks.get_mut(key) {
            ts.state = TaskStatus::Waiting;
            if waiting_on.is_empty() {
                recs.push((key.clone(), TaskStatus::Processing));
            }
            ts.waiting_on = waiting_on;
        }
        recs
    }

    fn to_processing(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        let Some(ts) = self.tasks.get(key) else {
            return Vec::new();
        };
        if !ts.waiting_on.is_empty() {
            return Vec::new();
        }
        let start = ts.state;
        let Some(worker) = self.decide_worker(key) else {
            return if start == TaskStatus::Waiting {
                vec![(key.clone(), TaskStatus::NoWorker)]
            } else {
                Vec::new()
            };
        };
        let duration = self.estimated_duration_ms(key);

        let mut who_has = WhoHas::new();
        let mut nbytes = BTreeMap::new();
        for dep in &ts.dependencies {
            if let Some(dts) = self.tasks.get(dep) {
                who_has.insert(dep.clone(), dts.who_has.iter().cloned().collect());
                if let Some(n) = dts.nbytes {
                    nbytes.insert(dep.clone(), n);
                }
            }
        }
        let Some(run_spec) = ts.run_spec.clone() else {
            return Vec::new();
        };
        let priority = ts.priority;
        let resources = ts.restrictions.resources.clone();

        self.unrunnable.remove(key);
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.state = TaskStatus::Processing;
            ts.processing_on = Some(worker.clone());
        }
        if let Some(ws) = self.workers.get_mut(&worker) {
            ws.processing.insert(key.clone(), duration);
            ws.refresh_occupancy();
        }
        self.outbox.to_worker(
            &worker,
            ToWorker::ComputeTask {
                key: key.clone(),
                run_spec,
                who_has,
                nbytes,
                priority,
                resources,
                stimulus_id: stimulus_id.to_string(),
            },
        );
        Vec::new()
    }

    fn waiting_no_worker(&mut self, key: &TaskKey) -> Recommendations {
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.state = TaskStatus::NoWorker;
            self.unrunnable.insert(key.clone());
        }
        Vec::new()
    }

    fn waiting_released(&mut self, key: &TaskKey) -> Recommendations {
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.state = TaskStatus::Released;
            ts.waiting_on.clear();
        }
        self.unrunnable.remove(key);
        let mut recs = self.drop_waiter(key);
        recs.extend(self.after_release(key));
        recs
    }

    pub(crate) fn processing_released(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        let Some(ts) = self.tasks.get_mut(key) else {
            return Vec::new();
        };
        ts.state = TaskStatus::Released;
        if let Some(worker) = ts.processing_on.take() {
            self.unassign(key, &worker);
            if self.workers.contains_key(&worker) {
                self.free_keys(&worker, key, stimulus_id);
            }
        }
        let mut recs = self.drop_waiter(key);
        recs.extend(self.after_release(key));
        recs
    }

    fn memory_released(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        let Some(ts) = self.tasks.get_mut(key) else {
            return Vec::new();
        };
        ts.state = TaskStatus::Released;
        let holders = mem::take(&mut ts.who_has);
        let wanted_by = ts.who_wants.clone();
        let dependents = ts.dependents.clone();

        for worker in &holders {
            if let Some(ws) = self.workers.get_mut(worker) {
                ws.has_what.remove(key);
                self.free_keys(worker, key, stimulus_id);
            }
        }
        // Only lost data is released while still wanted.
        for client in &wanted_by {
            self.outbox
                .to_client(client, ToClient::LostData { key: key.clone() });
        }

        let mut recs = Vec::new();
        for dep in &dependents {
            if let Some(dts) = self.tasks.get_mut(dep) {
                match dts.state {
                    TaskStatus::Processing | TaskStatus::NoWorker => {
                        recs.push((dep.clone(), TaskStatus::Released));
                    }
                    TaskStatus::Waiting => {
                        dts.waiting_on.insert(key.clone());
                    }
                    _ => {}
                }
            }
        }
        recs.extend(self.after_release(key));
        recs
    }

    fn forget(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        match self.tasks.get(key) {
            Some(ts) if ts.dependents.is_empty() && ts.who_wants.is_empty() => {}
            _ => return Vec::new(),
        }
        let Some(mut ts) = self.tasks.remove(key) else {
            return Vec::new();
        };
        ts.state = TaskStatus::Forgotten;
        self.unrunnable.remove(key);

        let holders: Vec<Address> = ts.who_has.iter().chain(&ts.erred_on).cloned().collect();
        for worker in &holders {
            if let Some(ws) = self.workers.get_mut(worker) {
                ws.has_what.remove(key);
                self.free_keys(worker, key, stimulus_id);
            }
        }

        let mut recs = Vec::new();
        for dep in &ts.dependencies {
            if let Some(dts) = self.tasks.get_mut(dep) {
                dts.dependents.remove(key);
                dts.waiters.remove(key);
                if let Some(rec) = release_recommendation(dts) {
                    recs.push(rec);
                }
            }
        }
        recs
    }

    fn dependency_erred(&mut self, key: &TaskKey, stimulus_id: &str) -> Recommendations {
        let Some(ts) = self.tasks.get(key) else {
            return Vec::new();
        };
        let failed = ts
            .dependencies
            .iter()
            .filter_map(|dep| self.tasks.get(dep))
            .find(|dts| dts.state == TaskStatus::Erred)
            .map(inherited_error);
        match failed {
            Some((error, blame)) => self.mark_erred(key, error, blame, stimulus_id),
            None => Vec::new(),
        }
    }

    // ── Event-driven transitions ────────────────────────────────────

    /// `processing → memory`: `worker` reported the result.
    pub(crate) fn processing_memory(
        &mut self,
        key: &TaskKey,
        worker: &Address,
        nbytes: u64,
        duration_ms: u64,
    ) -> Recommendations {
        let Some(ts) = self.tasks.get_mut(key) else {
            return Vec::new();
        };
        ts.state = TaskStatus::Memory;
        ts.processing_on = None;
        ts.nbytes = Some(nbytes);
        ts.who_has.insert(worker.clone());
        let prefix = ts.prefix.clone();
        let wanted_by = ts.who_wants.clone();
        let dependents = ts.dependents.clone();

        self.unassign(key, worker);
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.has_what.insert(key.clone());
        }
        self.prefixes
            .entry(prefix.clone())
            .or_insert_with(|| TaskPrefix {
                name: prefix,
                ..TaskPrefix::default()
            })
            .record(duration_ms as f64);

        for client in &wanted_by {
            self.outbox
                .to_client(client, ToClient::KeyInMemory { key: key.clone() });
        }

        let mut recs = Vec::new();
        for dep in &dependents {
            if let Some(dts) = self.tasks.get_mut(dep) {
                if dts.state == TaskStatus::Waiting {
                    dts.waiting_on.remove(key);
                    if dts.waiting_on.is_empty() {
                        recs.push((dep.clone(), TaskStatus::Processing));
                    }
                }
            }
        }
        recs.extend(self.drop_waiter(key));
        if let Some(rec) = self.tasks.get(key).and_then(release_recommendation) {
            recs.push(rec);
        }
        recs
    }

    /// Move `key` to `erred` with `error`, blaming the task whose code raised
    /// it, and recommend the same for every pending dependent.
    pub(crate) fn mark_erred(
        &mut self,
        key: &TaskKey,
        error: TaskError,
        blame: TaskKey,
        stimulus_id: &str,
    ) -> Recommendations {
        let Some(ts) = self.tasks.get_mut(key) else {
            return Vec::new();
        };
        debug!(key = %key, blame = %blame, error = %error, stimulus_id, "task erred");
        ts.state = TaskStatus::Erred;
        ts.waiting_on.clear();
        ts.exception = Some(error.clone());
        ts.exception_blame = Some(blame.clone());
        let worker = ts.processing_on.take();
        let wanted_by = ts.who_wants.clone();
        let dependents = ts.dependents.clone();

        if let Some(worker) = worker {
            self.unassign(key, &worker);
            if self.workers.contains_key(&worker) {
                if let Some(ts) = self.tasks.get_mut(key) {
                    ts.erred_on.insert(worker);
                }
            }
        }
        self.unrunnable.remove(key);

        for client in &wanted_by {
            self.outbox.to_client(
                client,
                ToClient::TaskErred {
                    key: key.clone(),
                    error: error.clone(),
                    blame: blame.clone(),
                },
            );
        }

        let mut recs = self.drop_waiter(key);
        for dep in &dependents {
            let pending = self.tasks.get(dep).is_some_and(|dts| {
                matches!(
                    dts.state,
                    TaskStatus::Waiting | TaskStatus::NoWorker | TaskStatus::Released
                )
            });
            if pending {
                recs.push((dep.clone(), TaskStatus::Erred));
            }
        }
        recs
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Remove `key` from `worker`'s processing set.
    fn unassign(&mut self, key: &TaskKey, worker: &Address) {
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.processing.remove(key);
            ws.long_running.remove(key);
            ws.refresh_occupancy();
        }
    }

    pub(crate) fn free_keys(&mut self, worker: &Address, key: &TaskKey, stimulus_id: &str) {
        self.outbox.to_worker(
            worker,
            ToWorker::FreeKeys {
                keys: vec![key.clone()],
                stimulus_id: stimulus_id.to_string(),
            },
        );
    }

    /// `key` stopped waiting on its dependencies: release the ones nobody
    /// needs any more.
    fn drop_waiter(&mut self, key: &TaskKey) -> Recommendations {
        let dependencies = match self.tasks.get(key) {
            Some(ts) => ts.dependencies.clone(),
            None => return Vec::new(),
        };
        let mut recs = Vec::new();
        for dep in &dependencies {
            if let Some(dts) = self.tasks.get_mut(dep) {
                dts.waiters.remove(key);
                if let Some(rec) = release_recommendation(dts) {
                    recs.push(rec);
                }
            }
        }
        recs
    }

    /// Where a freshly released task goes next: back to waiting if it is
    /// still needed, forgotten if nothing references it.
    fn after_release(&self, key: &TaskKey) -> Recommendations {
        match self.tasks.get(key) {
            Some(ts) if ts.is_needed() => vec![(key.clone(), TaskStatus::Waiting)],
            Some(ts) if ts.dependents.is_empty() => vec![(key.clone(), TaskStatus::Forgotten)],
            _ => Vec::new(),
        }
    }
}

/// Recommendation for a task that may have become unneeded.
pub(crate) fn release_recommendation(ts: &TaskState) -> Option<(TaskKey, TaskStatus)> {
    if ts.is_needed() {
        return None;
    }
    match ts.state {
        TaskStatus::Memory
        | TaskStatus::Waiting
        | TaskStatus::NoWorker
        | TaskStatus::Processing => Some((ts.key.clone(), TaskStatus::Released)),
        TaskStatus::Released | TaskStatus::Erred if ts.dependents.is_empty() => {
            Some((ts.key.clone(), TaskStatus::Forgotten))
        }
        _ => None,
    }
}

/// The error a dependent of the erred `dts` inherits, and whom it blames.
fn inherited_error(dts: &TaskState) -> (TaskError, TaskKey) {
    let error = dts
        .exception
        .clone()
        .unwrap_or_else(|| TaskError::lost_data(&dts.key));
    let blame = dts
        .exception_blame
        .clone()
        .unwrap_or_else(|| dts.key.clone());
    (error, blame)
}
