use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hive_core::protocol::{ToScheduler, WhoHas};
use hive_core::{Arg, RunSpec, TaskError, TaskKey, TaskPriority, WorkerTaskStatus};
use serde_json::Value;
use tracing::{debug, warn};

use super::{estimate_nbytes, Instruction, WorkerStateMachine};

use WorkerTaskStatus::*;

impl WorkerStateMachine {
    // ── Compute requests ────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_compute_task(
        &mut self,
        key: TaskKey,
        run_spec: RunSpec,
        who_has: &WhoHas,
        nbytes: &BTreeMap<TaskKey, u64>,
        priority: TaskPriority,
        resources: BTreeMap<String, f64>,
        stimulus_id: &str,
    ) {
        let current = self.tasks.get(&key).map(|ts| (ts.state, ts.previous, ts.priority));
        match current {
            Some((Memory, _, _)) => {
                // Already here, fetched as a dependency or computed before.
                let nbytes = self.tasks.get(&key).and_then(|ts| ts.nbytes).unwrap_or(0);
                self.send(ToScheduler::TaskFinished {
                    key,
                    nbytes,
                    duration_ms: 0,
                    stimulus_id: stimulus_id.to_string(),
                });
                return;
            }
            Some((Waiting | Ready | Constrained | Executing | LongRunning, _, _)) => {
                debug!(worker = %self.address, key = %key, "duplicate compute request");
                return;
            }
            Some((Cancelled | Resumed, Some(previous), _)) if previous.is_running() => {
                // The user code never stopped; keep its result after all.
                if let Some(ts) = self.tasks.get_mut(&key) {
                    ts.previous = None;
                    ts.next = None;
                }
                self.set_state(&key, previous, stimulus_id);
                return;
            }
            Some((Flight, _, _)) | Some((Cancelled | Resumed, Some(Flight), _)) => {
                // Let the transfer finish; compute only if it fails.
                if let Some(ts) = self.tasks.get_mut(&key) {
                    ts.previous = Some(Flight);
                    ts.next = Some(Waiting);
                    ts.run_spec = Some(run_spec);
                    ts.resource_restrictions = resources;
                }
                self.set_state(&key, Resumed, stimulus_id);
                return;
            }
            Some((Fetch, _, old_priority)) => {
                self.data_needed.remove(&(old_priority, key.clone()));
            }
            Some((Missing, _, _)) => {
                self.missing.remove(&key);
            }
            _ => {}
        }

        self.ensure_task(&key, priority);
        if let Some(ts) = self.tasks.get_mut(&key) {
            ts.run_spec = Some(run_spec);
            ts.priority = priority;
            ts.resource_restrictions = resources;
            ts.exception = None;
        }
        self.prepare_compute(&key, who_has, nbytes, stimulus_id);
    }

    /// Link `key` to its dependencies, start fetching what is not local and
    /// queue it once everything is.
    pub(super) fn prepare_compute(
        &mut self,
        key: &TaskKey,
        who_has: &WhoHas,
        nbytes: &BTreeMap<TaskKey, u64>,
        stimulus_id: &str,
    ) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        let Some(run_spec) = &ts.run_spec else {
            return;
        };
        let dependencies = run_spec.dependencies();
        let priority = ts.priority;

        let mut waiting = BTreeSet::new();
        for dep in &dependencies {
            self.ensure_task(dep, priority);
            if let Some(dts) = self.tasks.get_mut(dep) {
                dts.dependents.insert(key.clone());
                if let Some(n) = nbytes.get(dep) {
                    dts.nbytes = Some(*n);
                }
            }
            if let Some(holders) = who_has.get(dep) {
                self.set_sources(dep, holders, stimulus_id);
            }
            if self.need_dependency(dep, priority, stimulus_id) {
                waiting.insert(dep.clone());
            }
        }

        let ready = waiting.is_empty();
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.dependencies = dependencies;
            ts.waiting_for_data = waiting;
        }
        if ready {
            self.to_runnable(key, stimulus_id);
        } else {
            self.set_state(key, Waiting, stimulus_id);
        }
    }

    /// Make sure `dep` is on its way into local memory. Returns whether it
    /// is still pending.
    fn need_dependency(&mut self, dep: &TaskKey, priority: TaskPriority, stimulus_id: &str) -> bool {
        let Some(dts) = self.tasks.get_mut(dep) else {
            return false;
        };
        match dts.state {
            Memory => false,
            Released => {
                dts.priority = priority;
                self.to_fetch_or_missing(dep, stimulus_id);
                true
            }
            Fetch if priority < dts.priority => {
                let old = (dts.priority, dep.clone());
                dts.priority = priority;
                self.data_needed.remove(&old);
                self.data_needed.insert((priority, dep.clone()));
                true
            }
            Cancelled if dts.previous == Some(Flight) => {
                dts.previous = None;
                self.set_state(dep, Flight, stimulus_id);
                true
            }
            Cancelled => {
                // Still executing here; fall back to a fetch if that fails.
                dts.next = Some(Fetch);
                self.set_state(dep, Resumed, stimulus_id);
                true
            }
            _ => true,
        }
    }

    pub(super) fn to_runnable(&mut self, key: &TaskKey, stimulus_id: &str) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        let entry = (ts.priority, key.clone());
        if ts.resource_restrictions.is_empty() {
            self.ready.insert(entry);
            self.set_state(key, Ready, stimulus_id);
        } else {
            self.constrained.insert(entry);
            self.set_state(key, Constrained, stimulus_id);
        }
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Fill free execution slots, most urgent first.
    pub(super) fn ensure_computing(&mut self, stimulus_id: &str) {
        while self.executing.len() < self.nthreads {
            let ready = self.ready.first().cloned();
            let constrained = self
                .constrained
                .iter()
                .find(|(_, key)| self.resources_fit(key))
                .cloned();
            let next = match (ready, constrained) {
                (Some(r), Some(c)) => r.min(c),
                (Some(n), None) | (None, Some(n)) => n,
                (None, None) => break,
            };
            self.ready.remove(&next);
            self.constrained.remove(&next);
            self.start_execution(&next.1, stimulus_id);
        }
    }

    fn resources_fit(&self, key: &TaskKey) -> bool {
        self.tasks.get(key).is_some_and(|ts| {
            ts.resource_restrictions.iter().all(|(name, needed)| {
                self.available_resources.get(name).copied().unwrap_or(0.0) >= *needed
            })
        })
    }

    fn start_execution(&mut self, key: &TaskKey, stimulus_id: &str) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        let Some(run_spec) = ts.run_spec.clone() else {
            return;
        };
        let restrictions = ts.resource_restrictions.clone();
        let priority = ts.priority;

        match self.resolve(&run_spec) {
            Ok((args, kwargs)) => {
                for (name, amount) in &restrictions {
                    *self.available_resources.entry(name.clone()).or_insert(0.0) -= amount;
                }
                self.executing.insert(key.clone());
                self.set_state(key, Executing, stimulus_id);
                self.instructions.push(Instruction::Execute {
                    key: key.clone(),
                    function: run_spec.function,
                    args,
                    kwargs,
                    stimulus_id: stimulus_id.to_string(),
                });
            }
            Err(dep) => {
                warn!(worker = %self.address, key = %key, dependency = %dep, "dependency vanished before execution");
                if let Some(ts) = self.tasks.get_mut(key) {
                    ts.waiting_for_data.insert(dep.clone());
                }
                self.set_state(key, Waiting, stimulus_id);
                self.need_dependency(&dep, priority, stimulus_id);
            }
        }
    }

    /// Substitute local data for every dependency reference.
    #[allow(clippy::type_complexity)]
    fn resolve(
        &self,
        run_spec: &RunSpec,
    ) -> Result<(Vec<Arc<Value>>, BTreeMap<String, Arc<Value>>), TaskKey> {
        let args = run_spec
            .args
            .iter()
            .map(|arg| self.resolve_arg(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = run_spec
            .kwargs
            .iter()
            .map(|(name, arg)| Ok((name.clone(), self.resolve_arg(arg)?)))
            .collect::<Result<BTreeMap<_, _>, TaskKey>>()?;
        Ok((args, kwargs))
    }

    fn resolve_arg(&self, arg: &Arg) -> Result<Arc<Value>, TaskKey> {
        match arg {
            Arg::Value(v) => Ok(Arc::new(v.clone())),
            Arg::Future(key) => self.data.get(key).cloned().ok_or_else(|| key.clone()),
            Arg::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.resolve_arg(item).map(|v| Value::clone(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(Value::Array(values)))
            }
        }
    }

    /// Give back the execution slot and resources held by `key`.
    fn free_slot(&mut self, key: &TaskKey) {
        let held = self.executing.remove(key) | self.long_running.remove(key);
        if !held {
            return;
        }
        if let Some(ts) = self.tasks.get(key) {
            for (name, amount) in &ts.resource_restrictions {
                *self.available_resources.entry(name.clone()).or_insert(0.0) += amount;
            }
        }
    }

    // ── Results ─────────────────────────────────────────────────────

    pub(super) fn handle_execute_success(
        &mut self,
        key: TaskKey,
        value: Value,
        duration_ms: u64,
        stimulus_id: &str,
    ) {
        self.free_slot(&key);
        let Some(ts) = self.tasks.get(&key) else {
            return;
        };
        match (ts.state, ts.next) {
            (Executing | LongRunning, _) => {
                let nbytes = estimate_nbytes(&value);
                self.put_in_memory(&key, value, nbytes, stimulus_id);
                self.send(ToScheduler::TaskFinished {
                    key,
                    nbytes,
                    duration_ms,
                    stimulus_id: stimulus_id.to_string(),
                });
            }
            (Resumed, Some(Fetch)) => {
                // Another worker was asked for it meanwhile; offer a replica.
                let nbytes = estimate_nbytes(&value);
                self.put_in_memory(&key, value, nbytes, stimulus_id);
                self.send(ToScheduler::AddKeys {
                    keys: vec![key],
                    stimulus_id: stimulus_id.to_string(),
                });
            }
            (Cancelled, _) => self.discard(&key, stimulus_id),
            (state, _) => {
                debug!(worker = %self.address, key = %key, state = %state, "ignoring execution result");
            }
        }
    }

    pub(super) fn handle_execute_failure(&mut self, key: TaskKey, error: TaskError, stimulus_id: &str) {
        self.free_slot(&key);
        let Some(ts) = self.tasks.get_mut(&key) else {
            return;
        };
        match (ts.state, ts.next) {
            (Executing | LongRunning, _) => {
                debug!(worker = %self.address, key = %key, error = %error, "task failed");
                ts.exception = Some(error.clone());
                self.set_state(&key, Error, stimulus_id);
                self.send(ToScheduler::TaskErred {
                    key,
                    error,
                    stimulus_id: stimulus_id.to_string(),
                });
            }
            (Resumed, Some(Fetch)) => {
                ts.previous = None;
                ts.next = None;
                self.to_fetch_or_missing(&key, stimulus_id);
            }
            (Cancelled, _) => self.discard(&key, stimulus_id),
            _ => {}
        }
    }

    /// Store a result and wake the dependents that were waiting for it.
    pub(super) fn put_in_memory(&mut self, key: &TaskKey, value: Value, nbytes: u64, stimulus_id: &str) {
        self.data.insert(key.clone(), Arc::new(value));
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        ts.nbytes = Some(nbytes);
        ts.previous = None;
        ts.next = None;
        ts.active_source = None;
        let dependents: Vec<TaskKey> = ts.dependents.iter().cloned().collect();
        self.set_state(key, Memory, stimulus_id);

        for dependent in dependents {
            let Some(dts) = self.tasks.get_mut(&dependent) else {
                continue;
            };
            if dts.state == Waiting && dts.waiting_for_data.remove(key) && dts.waiting_for_data.is_empty() {
                self.to_runnable(&dependent, stimulus_id);
            }
        }
    }

    pub(super) fn handle_secede(&mut self, key: TaskKey, stimulus_id: &str) {
        if !self.executing.remove(&key) {
            return;
        }
        self.long_running.insert(key.clone());
        let Some(ts) = self.tasks.get_mut(&key) else {
            return;
        };
        match ts.state {
            Executing => {
                self.set_state(&key, LongRunning, stimulus_id);
                self.send(ToScheduler::LongRunning {
                    key,
                    stimulus_id: stimulus_id.to_string(),
                });
            }
            Cancelled | Resumed if ts.previous == Some(Executing) => {
                ts.previous = Some(LongRunning);
            }
            _ => {}
        }
    }
}
