//! Event handlers: one entry point per scheduler operation.
//!
//! Every handler mutates [`SchedulerState`], runs the transitions it
//! implies, and leaves the resulting messages in the outbox.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use hive_core::protocol::{ClientId, SchedulerQuery, SchedulerReply, ToClient, ToWorker, WorkerMetrics};
use hive_core::{Address, TaskError, TaskKey, TaskPriority, TaskSpec, TaskStatus};
use tracing::{debug, info, warn};

use crate::state::{ClientState, SchedulerState, TaskState, WorkerState};
use crate::transitions::{release_recommendation, Recommendations};

impl SchedulerState {
    // ── Clients ─────────────────────────────────────────────────────

    pub fn add_client(&mut self, client: &ClientId) {
        if !self.clients.contains_key(client) {
            info!(client = %client, "client connected");
            self.clients
                .insert(client.clone(), ClientState::new(client.clone()));
        }
    }

    /// Forget `client` and release everything it wanted.
    pub fn remove_client(&mut self, client: &ClientId, stimulus_id: &str) {
        let Some(cs) = self.clients.get(client) else {
            return;
        };
        let keys: Vec<TaskKey> = cs.wants_what.iter().cloned().collect();
        info!(client = %client, keys = keys.len(), "client closed");
        self.client_releases_keys(client, &keys, stimulus_id);
        self.clients.remove(client);
    }

    /// Merge a task graph into the scheduler and start computing `wanted`.
    ///
    /// Keys already known keep their state: a resubmitted key that is in
    /// memory is reported to the client right away, an erred one reports its
    /// error.
    pub fn submit_graph(
        &mut self,
        client: &ClientId,
        tasks: Vec<TaskSpec>,
        wanted: Vec<TaskKey>,
        stimulus_id: &str,
    ) {
        self.add_client(client);

        let mut touched = Vec::with_capacity(tasks.len());
        for spec in tasks {
            touched.push(spec.key.clone());
            self.merge_task(spec);
        }
        for key in &touched {
            self.link_dependents(key);
        }

        let mut recs = Recommendations::new();
        for key in &wanted {
            let Some(ts) = self.tasks.get_mut(key) else {
                warn!(client = %client, key = %key, "wanted key was not submitted");
                continue;
            };
            ts.who_wants.insert(client.clone());
            let state = ts.state;
            let exception = ts.exception.clone();
            let blame = ts.exception_blame.clone();
            if let Some(cs) = self.clients.get_mut(client) {
                cs.wants_what.insert(key.clone());
            }

            match state {
                TaskStatus::Released => recs.push((key.clone(), TaskStatus::Waiting)),
                TaskStatus::Memory => {
                    self.outbox
                        .to_client(client, ToClient::KeyInMemory { key: key.clone() });
                }
                TaskStatus::Erred => {
                    let error = exception.unwrap_or_else(|| TaskError::lost_data(key));
                    self.outbox.to_client(
                        client,
                        ToClient::TaskErred {
                            key: key.clone(),
                            error,
                            blame: blame.unwrap_or_else(|| key.clone()),
                        },
                    );
                }
                _ => {}
            }
        }

        // Submitted tasks nothing refers to would otherwise linger forever.
        for key in &touched {
            if wanted.contains(key) {
                continue;
            }
            if let Some(rec) = self.tasks.get(key).and_then(release_recommendation) {
                if rec.1 == TaskStatus::Forgotten {
                    recs.push(rec);
                }
            }
        }

        debug!(
            client = %client,
            tasks = touched.len(),
            wanted = wanted.len(),
            stimulus_id,
            "graph submitted"
        );
        self.transitions(recs, stimulus_id);
    }

    fn merge_task(&mut self, spec: TaskSpec) {
        let mut dependencies = spec.dependencies;
        if let Some(run_spec) = &spec.run_spec {
            dependencies.extend(run_spec.dependencies());
        }

        match self.tasks.get_mut(&spec.key) {
            Some(ts) => {
                // A placeholder learns how to compute itself.
                if ts.run_spec.is_none()
                    && spec.run_spec.is_some()
                    && ts.state == TaskStatus::Released
                {
                    ts.run_spec = spec.run_spec;
                    ts.dependencies = dependencies;
                    ts.retries_remaining = spec.retries;
                    ts.restrictions = spec.restrictions;
                }
            }
            None => {
                let generation = self.next_generation();
                let priority = TaskPriority::new(spec.priority, generation);
                let mut ts = TaskState::new(spec.key.clone(), spec.run_spec, priority);
                ts.dependencies = dependencies;
                ts.retries_remaining = spec.retries;
                ts.restrictions = spec.restrictions;
                self.tasks.insert(spec.key, ts);
            }
        }
    }

    fn link_dependents(&mut self, key: &TaskKey) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        for dep in ts.dependencies.clone() {
            if let Some(dts) = self.tasks.get_mut(&dep) {
                dts.dependents.insert(key.clone());
            }
        }
    }

    /// `client` dropped its futures for `keys`.
    pub fn client_releases_keys(&mut self, client: &ClientId, keys: &[TaskKey], stimulus_id: &str) {
        let mut recs = Recommendations::new();
        for key in keys {
            if let Some(cs) = self.clients.get_mut(client) {
                cs.wants_what.remove(key);
            }
            if let Some(ts) = self.tasks.get_mut(key) {
                if ts.who_wants.remove(client) {
                    recs.extend(release_recommendation(ts));
                }
            }
        }
        self.transitions(recs, stimulus_id);
    }

    /// Cancel `keys` for `client`, or for every client when `force` is set.
    ///
    /// Dependents are cancelled first when nobody else needs the key.
    pub fn cancel_keys(&mut self, client: &ClientId, keys: &[TaskKey], force: bool, stimulus_id: &str) {
        for key in keys {
            self.cancel_key(key, client, force, stimulus_id);
        }
    }

    fn cancel_key(&mut self, key: &TaskKey, client: &ClientId, force: bool, stimulus_id: &str) {
        let Some(ts) = self.tasks.get(key) else {
            return;
        };
        let sole_wanter = ts.who_wants.len() == 1 && ts.who_wants.contains(client);
        if force || sole_wanter {
            for dependent in ts.dependents.clone() {
                self.cancel_key(&dependent, client, force, stimulus_id);
            }
        }

        let clients: Vec<ClientId> = match self.tasks.get(key) {
            Some(ts) if force => ts.who_wants.iter().cloned().collect(),
            Some(ts) if ts.who_wants.contains(client) => vec![client.clone()],
            _ => Vec::new(),
        };
        for c in clients {
            info!(client = %c, key = %key, stimulus_id, "cancelling key");
            self.outbox.to_client(
                &c,
                ToClient::CancelledKeys {
                    keys: vec![key.clone()],
                },
            );
            self.client_releases_keys(&c, std::slice::from_ref(key), stimulus_id);
        }
    }

    /// Drop every task and client, cancel every client's futures and
    /// terminate every worker. Returns how many workers were running.
    ///
    /// Clients are registered again by their next submission.
    pub fn restart(&mut self, stimulus_id: &str) -> usize {
        for (id, cs) in std::mem::take(&mut self.clients) {
            if cs.wants_what.is_empty() {
                continue;
            }
            let keys = cs.wants_what.into_iter().collect();
            self.outbox.to_client(&id, ToClient::CancelledKeys { keys });
        }

        let workers = std::mem::take(&mut self.workers);
        for address in workers.keys() {
            self.outbox.to_worker(
                address,
                ToWorker::Terminate {
                    reason: "restart".to_string(),
                },
            );
        }
        info!(
            workers = workers.len(),
            tasks = self.tasks.len(),
            stimulus_id,
            "restarting cluster"
        );
        self.tasks.clear();
        self.unrunnable.clear();
        workers.len()
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub fn is_worker(&self, address: &Address) -> bool {
        self.workers.contains_key(address)
    }

    /// Register a worker and hand it any tasks that were waiting for one.
    pub fn add_worker(
        &mut self,
        address: &Address,
        nthreads: usize,
        resources: BTreeMap<String, f64>,
        now: Instant,
        stimulus_id: &str,
    ) {
        if self.workers.contains_key(address) {
            warn!(worker = %address, "worker registered twice");
            return;
        }
        info!(worker = %address, nthreads, "worker registered");
        self.workers.insert(
            address.clone(),
            WorkerState::new(address.clone(), nthreads, resources, now),
        );

        let recs = self
            .unrunnable
            .iter()
            .map(|key| (key.clone(), TaskStatus::Processing))
            .collect();
        self.transitions(recs, stimulus_id);
    }

    /// Remove a departed worker, rescheduling what it ran and recomputing
    /// what only it held. Returns `false` for an unknown worker.
    pub fn remove_worker(&mut self, address: &Address, reason: &str, stimulus_id: &str) -> bool {
        let Some(ws) = self.workers.remove(address) else {
            return false;
        };
        info!(
            worker = %address,
            reason,
            processing = ws.processing.len(),
            held = ws.has_what.len(),
            stimulus_id,
            "removing worker"
        );

        let mut recs = Recommendations::new();
        for key in ws.processing.keys() {
            let Some(ts) = self.tasks.get_mut(key) else {
                continue;
            };
            if ts.processing_on.as_ref() != Some(address) {
                continue;
            }
            ts.suspicious += 1;
            let suspicious = ts.suspicious;
            if suspicious > self.config.allowed_failures {
                warn!(key = %key, worker = %address, suspicious, "task killed too many workers");
                let error = TaskError::killed_worker(key, address, suspicious);
                recs.extend(self.logged(key, stimulus_id, |s| {
                    s.mark_erred(key, error, key.clone(), stimulus_id)
                }));
            } else {
                recs.extend(self.logged(key, stimulus_id, |s| {
                    s.processing_released(key, stimulus_id)
                }));
            }
        }

        for key in &ws.has_what {
            if let Some(ts) = self.tasks.get_mut(key) {
                ts.who_has.remove(address);
                if ts.state == TaskStatus::Memory && ts.who_has.is_empty() {
                    recs.push((key.clone(), TaskStatus::Released));
                }
            }
        }
        for ts in self.tasks.values_mut() {
            ts.erred_on.remove(address);
        }

        for other in self.workers.keys() {
            self.outbox.to_worker(
                other,
                ToWorker::WorkerRemoved {
                    address: address.clone(),
                    stimulus_id: stimulus_id.to_string(),
                },
            );
        }

        self.transitions(recs, stimulus_id);
        true
    }

    /// Record a heartbeat. Returns `false` for an unknown worker, which
    /// should re-register.
    pub fn heartbeat(&mut self, address: &Address, metrics: WorkerMetrics, now: Instant) -> bool {
        match self.workers.get_mut(address) {
            Some(ws) => {
                ws.last_seen = now;
                ws.last_seen_at = chrono::Utc::now();
                ws.metrics = metrics;
                true
            }
            None => false,
        }
    }

    /// Workers whose last heartbeat is older than the TTL.
    pub fn expired_workers(&self, now: Instant) -> Vec<Address> {
        let ttl = self.config.worker_ttl();
        self.workers
            .values()
            .filter(|ws| now.saturating_duration_since(ws.last_seen) > ttl)
            .map(|ws| ws.address.clone())
            .collect()
    }

    pub fn task_finished(
        &mut self,
        worker: &Address,
        key: &TaskKey,
        nbytes: u64,
        duration_ms: u64,
        stimulus_id: &str,
    ) {
        if !self.workers.contains_key(worker) {
            debug!(worker = %worker, key = %key, "result from unknown worker");
            return;
        }
        let current = self
            .tasks
            .get(key)
            .map(|ts| (ts.state, ts.processing_on.clone()));

        match current {
            Some((TaskStatus::Processing, Some(on))) if &on == worker => {
                let recs = self.logged(key, stimulus_id, |s| {
                    s.processing_memory(key, worker, nbytes, duration_ms)
                });
                self.transitions(recs, stimulus_id);
            }
            Some((TaskStatus::Memory, _)) => self.add_replica(key, worker),
            _ => {
                debug!(worker = %worker, key = %key, "unexpected task-finished, freeing");
                self.free_keys(worker, key, stimulus_id);
            }
        }
    }

    /// The task raised. Retry while retries remain, otherwise fail it and
    /// everything depending on it.
    pub fn task_erred(&mut self, worker: &Address, key: &TaskKey, error: TaskError, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        if ts.state != TaskStatus::Processing || ts.processing_on.as_ref() != Some(worker) {
            debug!(worker = %worker, key = %key, state = %ts.state, "stale task-erred");
            return;
        }

        let recs = if ts.retries_remaining > 0 {
            ts.retries_remaining -= 1;
            let retries_remaining = ts.retries_remaining;
            info!(key = %key, retries_remaining, error = %error, "retrying task");
            self.logged(key, stimulus_id, |s| s.processing_released(key, stimulus_id))
        } else {
            info!(key = %key, error = %error, "task failed");
            self.logged(key, stimulus_id, |s| {
                s.mark_erred(key, error, key.clone(), stimulus_id)
            })
        };
        self.transitions(recs, stimulus_id);
    }

    /// A peer failed to deliver `key` from `errant`.
    pub fn missing_data(&mut self, key: &TaskKey, errant: &Address, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        if !ts.who_has.remove(errant) {
            return;
        }
        let lost = ts.state == TaskStatus::Memory && ts.who_has.is_empty();
        debug!(key = %key, errant = %errant, lost, stimulus_id, "replica reported missing");

        if let Some(ws) = self.workers.get_mut(errant) {
            ws.has_what.remove(key);
            self.free_keys(errant, key, stimulus_id);
        }
        if lost {
            self.transitions(vec![(key.clone(), TaskStatus::Released)], stimulus_id);
        }
    }

    /// `worker` fetched replicas of `keys`.
    pub fn add_keys(&mut self, worker: &Address, keys: &[TaskKey], stimulus_id: &str) {
        if !self.workers.contains_key(worker) {
            return;
        }
        for key in keys {
            let in_memory = self
                .tasks
                .get(key)
                .is_some_and(|ts| ts.state == TaskStatus::Memory);
            if in_memory {
                self.add_replica(key, worker);
            } else {
                self.free_keys(worker, key, stimulus_id);
            }
        }
    }

    fn add_replica(&mut self, key: &TaskKey, worker: &Address) {
        if let Some(ts) = self.tasks.get_mut(key) {
            ts.who_has.insert(worker.clone());
        }
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.has_what.insert(key.clone());
        }
    }

    pub fn request_who_has(&mut self, worker: &Address, keys: &[TaskKey], stimulus_id: &str) {
        let who_has = keys
            .iter()
            .filter_map(|key| {
                self.tasks
                    .get(key)
                    .map(|ts| (key.clone(), ts.who_has.iter().cloned().collect()))
            })
            .collect();
        self.outbox.to_worker(
            worker,
            ToWorker::RefreshWhoHas {
                who_has,
                stimulus_id: stimulus_id.to_string(),
            },
        );
    }

    /// `key` seceded on `worker`; stop counting it toward occupancy.
    pub fn long_running(&mut self, worker: &Address, key: &TaskKey) {
        let processing_here = self
            .tasks
            .get(key)
            .is_some_and(|ts| ts.processing_on.as_ref() == Some(worker));
        if !processing_here {
            return;
        }
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.long_running.insert(key.clone());
            ws.refresh_occupancy();
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn query(&self, query: &SchedulerQuery) -> SchedulerReply {
        match query {
            SchedulerQuery::WhoHas { keys } => {
                let holders = |ts: &TaskState| ts.who_has.iter().cloned().collect::<Vec<_>>();
                let who_has = match keys {
                    Some(keys) => keys
                        .iter()
                        .map(|k| (k.clone(), self.tasks.get(k).map(holders).unwrap_or_default()))
                        .collect(),
                    None => self
                        .tasks
                        .values()
                        .map(|ts| (ts.key.clone(), holders(ts)))
                        .collect(),
                };
                SchedulerReply::WhoHas(who_has)
            }
            SchedulerQuery::HasWhat => SchedulerReply::HasWhat(
                self.workers
                    .values()
                    .map(|ws| (ws.address.clone(), ws.has_what.iter().cloned().collect()))
                    .collect(),
            ),
            SchedulerQuery::Processing => SchedulerReply::Processing(
                self.workers
                    .values()
                    .map(|ws| (ws.address.clone(), ws.processing.keys().cloned().collect()))
                    .collect(),
            ),
            SchedulerQuery::TaskStates => SchedulerReply::TaskStates(
                self.tasks
                    .values()
                    .map(|ts| (ts.key.clone(), ts.state))
                    .collect(),
            ),
            SchedulerQuery::Workers => {
                SchedulerReply::Workers(self.workers.values().map(WorkerState::info).collect())
            }
        }
    }

}
