//! Thread pool running task functions off the async runtime.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use hive_core::{Function, TaskCall, TaskError, TaskResult};
use tracing::debug;

use crate::error::WorkerError;

pub struct ExecutionPool {
    pool: rayon::ThreadPool,
}

impl ExecutionPool {
    /// `nthreads` execution slots plus `long_running` spare threads for
    /// tasks that seceded from theirs.
    pub fn new(nthreads: usize, long_running: usize) -> Result<Self, WorkerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads.max(1) + long_running)
            .thread_name(|i| format!("hive-exec-{i}"))
            .build()
            .map_err(|e| WorkerError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `function` on the pool and hand its outcome to `done`.
    ///
    /// A panicking task is reported as a failed task rather than taking the
    /// pool thread down.
    pub fn execute<F>(&self, function: Function, call: TaskCall, done: F)
    where
        F: FnOnce(TaskResult, Duration) + Send + 'static,
    {
        self.pool.spawn(move || {
            let start = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| function.call(&call)))
                .unwrap_or_else(|payload| Err(TaskError::panic(panic_message(payload.as_ref()))));
            let elapsed = start.elapsed();
            debug!(key = %call.key(), function = function.name(), ?elapsed, "task body returned");
            done(result, elapsed);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::mpsc;

    use hive_core::TaskKey;
    use serde_json::Value;

    use super::*;

    fn run(function: Function) -> TaskResult {
        let pool = ExecutionPool::new(1, 0).unwrap();
        let (tx, rx) = mpsc::channel();
        let call = TaskCall::new(TaskKey::new("t"), vec![std::sync::Arc::new(Value::from(1))], BTreeMap::new());
        pool.execute(function, call, move |result, _| {
            tx.send(result).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn result_is_delivered() {
        let inc = Function::new("inc", |call: &TaskCall| Ok(Value::from(call.arg_i64(0)? + 1)));
        assert_eq!(run(inc).unwrap(), Value::from(2));
    }

    #[test]
    fn panic_becomes_a_task_error() {
        let boom = Function::new("boom", |_: &TaskCall| panic!("kaboom"));
        let error = run(boom).unwrap_err();
        assert!(error.message.contains("kaboom"));
    }

    #[test]
    fn spare_threads_are_added_for_long_running_tasks() {
        let pool = ExecutionPool::new(2, 3).unwrap();
        assert_eq!(pool.threads(), 5);
    }
}
