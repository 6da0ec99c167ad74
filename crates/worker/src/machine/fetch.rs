use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use hive_core::protocol::{DataResponse, ToScheduler};
use hive_core::{Address, TaskKey, WorkerTaskStatus};
use tracing::{debug, warn};

use super::{estimate_nbytes, InFlight, Instruction, WorkerStateMachine};

use WorkerTaskStatus::*;

impl WorkerStateMachine {
    // ── Sources ─────────────────────────────────────────────────────

    /// Replace the peers believed to hold `key`.
    pub(super) fn set_sources(&mut self, key: &TaskKey, holders: &[Address], stimulus_id: &str) {
        let sources: BTreeSet<Address> = holders
            .iter()
            .filter(|a| **a != self.address)
            .cloned()
            .collect();
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        let old = mem::replace(&mut ts.candidate_sources, sources.clone());
        let state = ts.state;
        let entry = (ts.priority, key.clone());

        for gone in old.difference(&sources) {
            if let Some(keys) = self.has_what.get_mut(gone) {
                keys.remove(key);
                if keys.is_empty() {
                    self.has_what.remove(gone);
                }
            }
        }
        for source in &sources {
            self.has_what
                .entry(source.clone())
                .or_default()
                .insert(key.clone());
        }

        match state {
            Missing if !sources.is_empty() => {
                self.missing.remove(key);
                self.to_fetch(key, stimulus_id);
            }
            Fetch if sources.is_empty() => {
                self.data_needed.remove(&entry);
                self.to_missing(key, stimulus_id);
            }
            _ => {}
        }
    }

    /// `worker` left the cluster or stopped answering.
    pub(super) fn purge_source(&mut self, worker: &Address, stimulus_id: &str) {
        let keys = self.has_what.remove(worker).unwrap_or_default();
        if !keys.is_empty() {
            debug!(worker = %self.address, peer = %worker, keys = keys.len(), "dropping peer as a source");
        }
        for key in &keys {
            let Some(ts) = self.tasks.get_mut(key) else {
                continue;
            };
            ts.candidate_sources.remove(worker);
            if ts.state == Fetch && ts.candidate_sources.is_empty() {
                let entry = (ts.priority, key.clone());
                self.data_needed.remove(&entry);
                self.to_missing(key, stimulus_id);
            }
        }
    }

    pub(super) fn to_fetch_or_missing(&mut self, key: &TaskKey, stimulus_id: &str) {
        let has_source = self
            .tasks
            .get(key)
            .is_some_and(|ts| !ts.candidate_sources.is_empty());
        if has_source {
            self.to_fetch(key, stimulus_id);
        } else {
            self.to_missing(key, stimulus_id);
        }
    }

    fn to_fetch(&mut self, key: &TaskKey, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        ts.active_source = None;
        self.data_needed.insert((ts.priority, key.clone()));
        self.set_state(key, Fetch, stimulus_id);
    }

    fn to_missing(&mut self, key: &TaskKey, stimulus_id: &str) {
        if !self.tasks.contains_key(key) {
            return;
        }
        self.missing.insert(key.clone());
        self.set_state(key, Missing, stimulus_id);
        self.send(ToScheduler::RequestWhoHas {
            keys: vec![key.clone()],
        });
    }

    // ── Transfers ───────────────────────────────────────────────────

    /// Start gathers while below the transfer limit, one per peer, batching
    /// several keys held by the same peer.
    pub(super) fn ensure_communicating(&mut self, stimulus_id: &str) {
        let mut skipped = Vec::new();
        while self.in_flight_workers.len() < self.transfer_limit {
            let Some((priority, key)) = self.data_needed.pop_first() else {
                break;
            };
            let Some(ts) = self.tasks.get(&key) else {
                continue;
            };
            if ts.state != Fetch {
                continue;
            }
            if ts.candidate_sources.is_empty() {
                self.to_missing(&key, stimulus_id);
                continue;
            }
            let Some(worker) = ts
                .candidate_sources
                .iter()
                .find(|w| !self.in_flight_workers.contains_key(*w))
                .cloned()
            else {
                // Every holder is busy serving us already.
                skipped.push((priority, key));
                continue;
            };

            let mut keys = vec![key];
            let batch: Vec<(_, TaskKey)> = self
                .data_needed
                .iter()
                .filter(|(_, k)| {
                    self.tasks
                        .get(k)
                        .is_some_and(|t| t.state == Fetch && t.candidate_sources.contains(&worker))
                })
                .take(self.transfer_batch_keys.saturating_sub(1))
                .cloned()
                .collect();
            for entry in batch {
                self.data_needed.remove(&entry);
                keys.push(entry.1);
            }

            let gather_id = self.next_gather_id;
            self.next_gather_id += 1;
            for key in &keys {
                if let Some(ts) = self.tasks.get_mut(key) {
                    ts.active_source = Some(worker.clone());
                }
                self.set_state(key, Flight, stimulus_id);
            }
            debug!(
                worker = %self.address,
                peer = %worker,
                gather_id,
                keys = keys.len(),
                "gathering dependencies"
            );
            self.in_flight_workers.insert(worker.clone(), gather_id);
            self.gathers.insert(
                gather_id,
                InFlight {
                    worker: worker.clone(),
                    keys: keys.clone(),
                },
            );
            self.instructions.push(Instruction::Gather {
                gather_id,
                worker,
                keys,
                stimulus_id: stimulus_id.to_string(),
            });
        }
        self.data_needed.extend(skipped);
    }

    pub(super) fn handle_gather_success(&mut self, gather_id: u64, response: DataResponse, stimulus_id: &str) {
        let Some(gather) = self.gathers.remove(&gather_id) else {
            debug!(worker = %self.address, gather_id, "result of an aborted gather");
            return;
        };
        self.in_flight_workers.remove(&gather.worker);

        let DataResponse { mut data, .. } = response;
        let mut received = Vec::new();
        for key in gather.keys {
            let Some(ts) = self.tasks.get(&key) else {
                continue;
            };
            let (state, next, known_nbytes) = (ts.state, ts.next, ts.nbytes);
            let Some(value) = data.remove(&key) else {
                self.source_failed(&key, &gather.worker, stimulus_id);
                continue;
            };
            let nbytes = known_nbytes.unwrap_or_else(|| estimate_nbytes(&value));
            match (state, next) {
                (Flight, _) => {
                    self.put_in_memory(&key, value, nbytes, stimulus_id);
                    received.push(key);
                }
                (Resumed, Some(Waiting)) => {
                    // The scheduler asked us to compute it; the transfer won.
                    self.put_in_memory(&key, value, nbytes, stimulus_id);
                    self.send(ToScheduler::TaskFinished {
                        key,
                        nbytes,
                        duration_ms: 0,
                        stimulus_id: stimulus_id.to_string(),
                    });
                }
                (Cancelled, _) => self.discard(&key, stimulus_id),
                _ => {}
            }
        }
        if !received.is_empty() {
            self.send(ToScheduler::AddKeys {
                keys: received,
                stimulus_id: stimulus_id.to_string(),
            });
        }
    }

    pub(super) fn handle_gather_failed(&mut self, gather_id: u64, stimulus_id: &str) {
        let Some(gather) = self.gathers.remove(&gather_id) else {
            return;
        };
        self.in_flight_workers.remove(&gather.worker);
        warn!(
            worker = %self.address,
            peer = %gather.worker,
            keys = gather.keys.len(),
            "gather from peer failed"
        );
        for key in &gather.keys {
            self.source_failed(key, &gather.worker, stimulus_id);
        }
        self.purge_source(&gather.worker, stimulus_id);
    }

    /// `worker` did not deliver `key`: report it and find another way.
    fn source_failed(&mut self, key: &TaskKey, worker: &Address, stimulus_id: &str) {
        let Some(ts) = self.tasks.get_mut(key) else {
            return;
        };
        ts.candidate_sources.remove(worker);
        ts.active_source = None;
        let (state, next) = (ts.state, ts.next);
        if let Some(keys) = self.has_what.get_mut(worker) {
            keys.remove(key);
        }
        self.send(ToScheduler::MissingData {
            key: key.clone(),
            errant_worker: worker.clone(),
            stimulus_id: stimulus_id.to_string(),
        });

        match (state, next) {
            (Flight, _) => self.to_fetch_or_missing(key, stimulus_id),
            (Resumed, Some(Waiting)) => {
                if let Some(ts) = self.tasks.get_mut(key) {
                    ts.previous = None;
                    ts.next = None;
                }
                self.prepare_compute(key, &BTreeMap::new(), &BTreeMap::new(), stimulus_id);
            }
            (Cancelled, _) => self.discard(key, stimulus_id),
            _ => {}
        }
    }

    /// Abort the gather from `source` once none of its keys is wanted.
    pub(super) fn maybe_abort_gather(&mut self, source: &Address, stimulus_id: &str) {
        let Some(&gather_id) = self.in_flight_workers.get(source) else {
            return;
        };
        let Some(gather) = self.gathers.get(&gather_id) else {
            return;
        };
        let unwanted = gather.keys.iter().all(|k| {
            self.tasks
                .get(k)
                .map_or(true, |ts| ts.state == Cancelled)
        });
        if !unwanted {
            return;
        }
        let Some(gather) = self.gathers.remove(&gather_id) else {
            return;
        };
        self.in_flight_workers.remove(source);
        debug!(worker = %self.address, peer = %source, gather_id, "aborting gather");
        for key in &gather.keys {
            self.discard(key, stimulus_id);
        }
        self.instructions.push(Instruction::AbortGather { gather_id });
    }
}
