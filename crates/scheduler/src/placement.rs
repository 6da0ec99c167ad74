//! Worker selection for runnable tasks.

use std::cmp::Ordering;

use hive_core::{Address, TaskKey};

use crate::state::{SchedulerState, TaskState, WorkerState};

impl SchedulerState {
    /// Pick the worker that would finish `key` soonest, or `None` when no
    /// running worker satisfies its restrictions.
    ///
    /// Projected completion is `(occupancy + estimated duration) / nthreads`.
    /// Ties go to the worker already holding the most dependency replicas,
    /// then to the lowest address so placement is deterministic.
    pub fn decide_worker(&self, key: &TaskKey) -> Option<Address> {
        let ts = self.tasks.get(key)?;
        let duration = self.estimated_duration_ms(key);

        let candidates = self.valid_workers(ts);
        candidates
            .into_iter()
            .map(|ws| {
                let completion = (ws.occupancy + duration) / ws.nthreads as f64;
                let held = ts
                    .dependencies
                    .iter()
                    .filter(|dep| ws.has_what.contains(*dep))
                    .count();
                (ws, completion, held)
            })
            .min_by(|(a, a_time, a_held), (b, b_time, b_held)| {
                a_time
                    .partial_cmp(b_time)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b_held.cmp(a_held))
                    .then_with(|| a.address.cmp(&b.address))
            })
            .map(|(ws, _, _)| ws.address.clone())
    }

    /// Running workers allowed to run `ts`.
    ///
    /// A `workers=` restriction limits the set unless `allow_other_workers`
    /// is set, in which case the listed workers are preferred and every
    /// other worker is a fallback. Resource requirements always apply.
    fn valid_workers(&self, ts: &TaskState) -> Vec<&WorkerState> {
        let fits: Vec<&WorkerState> = self
            .workers
            .values()
            .filter(|ws| has_resources(ws, ts))
            .collect();

        let Some(allowed) = &ts.restrictions.workers else {
            return fits;
        };
        let preferred: Vec<&WorkerState> = fits
            .iter()
            .copied()
            .filter(|ws| allowed.contains(&ws.address))
            .collect();
        if preferred.is_empty() && ts.restrictions.allow_other_workers {
            fits
        } else {
            preferred
        }
    }
}

fn has_resources(ws: &WorkerState, ts: &TaskState) -> bool {
    ts.restrictions
        .resources
        .iter()
        .all(|(name, needed)| ws.resources.get(name).is_some_and(|have| have >= needed))
}
