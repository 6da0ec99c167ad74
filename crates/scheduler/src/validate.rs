//! Consistency checks over the whole scheduler state, run after every event
//! when `validate` is enabled and directly by tests.

use hive_core::TaskStatus;

use crate::error::SchedulerError;
use crate::state::SchedulerState;

macro_rules! ensure {
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err(SchedulerError::Validation(format!($($fmt)+)));
        }
    };
}

impl SchedulerState {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for ts in self.tasks.values() {
            let key = &ts.key;

            // A task that erred on a missing dependency never got linked to it.
            for dep in &ts.dependencies {
                if ts.state == TaskStatus::Erred {
                    break;
                }
                if let Some(dts) = self.tasks.get(dep) {
                    ensure!(
                        dts.dependents.contains(key),
                        "{dep} does not list dependent {key}"
                    );
                }
            }
            for dependent in &ts.dependents {
                let linked = self
                    .tasks
                    .get(dependent)
                    .is_some_and(|dts| dts.dependencies.contains(key));
                ensure!(linked, "dependent {dependent} of {key} is missing or unlinked");
            }
            for waiter in &ts.waiters {
                ensure!(
                    ts.dependents.contains(waiter),
                    "waiter {waiter} of {key} is not a dependent"
                );
            }

            let processing = ts.state == TaskStatus::Processing;
            ensure!(
                processing == ts.processing_on.is_some(),
                "{key} is {} with processing_on={:?}",
                ts.state,
                ts.processing_on
            );
            if let Some(worker) = &ts.processing_on {
                let assigned = self
                    .workers
                    .get(worker)
                    .is_some_and(|ws| ws.processing.contains_key(key));
                ensure!(assigned, "{key} not in processing set of {worker}");
            }

            ensure!(
                (ts.state == TaskStatus::Erred) == ts.exception.is_some(),
                "{key} is {} but exception presence is {}",
                ts.state,
                ts.exception.is_some()
            );
            ensure!(
                (ts.state == TaskStatus::Memory) == !ts.who_has.is_empty(),
                "{key} is {} with {} holders",
                ts.state,
                ts.who_has.len()
            );
            for worker in &ts.who_has {
                let holds = self
                    .workers
                    .get(worker)
                    .is_some_and(|ws| ws.has_what.contains(key));
                ensure!(holds, "{worker} holds {key} but does not list it");
            }

            ensure!(
                (ts.state == TaskStatus::NoWorker) == self.unrunnable.contains(key),
                "{key} is {} but unrunnable membership is {}",
                ts.state,
                self.unrunnable.contains(key)
            );
            if ts.state == TaskStatus::Waiting {
                for dep in &ts.waiting_on {
                    let pending = self
                        .tasks
                        .get(dep)
                        .is_some_and(|dts| dts.state != TaskStatus::Memory);
                    ensure!(pending, "{key} waits on {dep} which is not pending");
                }
            }

            for client in &ts.who_wants {
                let wants = self
                    .clients
                    .get(client)
                    .is_some_and(|cs| cs.wants_what.contains(key));
                ensure!(wants, "{client} wants {key} but does not list it");
            }
        }

        for ws in self.workers.values() {
            for key in ws.processing.keys() {
                let on_here = self
                    .tasks
                    .get(key)
                    .is_some_and(|ts| ts.processing_on.as_ref() == Some(&ws.address));
                ensure!(on_here, "{} processes {key} which is not assigned to it", ws.address);
            }
            for key in &ws.has_what {
                let listed = self
                    .tasks
                    .get(key)
                    .is_some_and(|ts| ts.who_has.contains(&ws.address));
                ensure!(listed, "{} lists {key} which does not name it", ws.address);
            }
        }

        for cs in self.clients.values() {
            for key in &cs.wants_what {
                let listed = self
                    .tasks
                    .get(key)
                    .is_some_and(|ts| ts.who_wants.contains(&cs.id));
                ensure!(listed, "{} wants unknown or unlinked {key}", cs.id);
            }
        }
        Ok(())
    }
}
