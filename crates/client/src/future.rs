//! Handles to the results of submitted tasks.
//!
//! Every [`TaskFuture`] for one key shares a single [`FutureState`] owned by
//! the client. The client's reactor moves that state as scheduler messages
//! arrive; handles only observe it. The key stays wanted on the scheduler
//! until the last handle is dropped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hive_core::{Arg, TaskError, TaskKey};
use serde_json::Value;
use tokio::sync::watch;

use crate::client::ClientInner;
use crate::error::ClientError;

// ── Status ──────────────────────────────────────────────────────────

/// Client-side view of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum FutureStatus {
    Pending,
    Finished,
    Error(TaskError),
    Cancelled,
}

impl FutureStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FutureStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FutureStatus::Pending => "pending",
            FutureStatus::Finished => "finished",
            FutureStatus::Error(_) => "error",
            FutureStatus::Cancelled => "cancelled",
        }
    }
}

pub(crate) type DoneCallback = Box<dyn FnOnce(TaskFuture) + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Shared state ────────────────────────────────────────────────────

pub(crate) struct FutureState {
    key: TaskKey,
    status: watch::Sender<FutureStatus>,
    callbacks: Mutex<Vec<DoneCallback>>,
    value: Mutex<Option<Arc<Value>>>,
}

impl FutureState {
    pub(crate) fn new(key: TaskKey) -> Arc<Self> {
        let (status, _) = watch::channel(FutureStatus::Pending);
        Arc::new(Self {
            key,
            status,
            callbacks: Mutex::new(Vec::new()),
            value: Mutex::new(None),
        })
    }

    pub(crate) fn key(&self) -> &TaskKey {
        &self.key
    }

    pub(crate) fn status(&self) -> FutureStatus {
        self.status.borrow().clone()
    }

    /// Move to `status` and hand back the callbacks that are now due.
    ///
    /// A cancelled key only leaves `cancelled` through [`Self::reset`]:
    /// late reports for a computation the client gave up on are ignored.
    pub(crate) fn set(&self, status: FutureStatus) -> Vec<DoneCallback> {
        let mut callbacks = lock(&self.callbacks);
        if *self.status.borrow() == FutureStatus::Cancelled {
            return Vec::new();
        }
        let terminal = status.is_terminal();
        self.status.send_replace(status);
        if terminal {
            std::mem::take(&mut *callbacks)
        } else {
            Vec::new()
        }
    }

    /// Back to pending after a resubmission of a cancelled key.
    pub(crate) fn reset(&self) {
        let _callbacks = lock(&self.callbacks);
        if *self.status.borrow() == FutureStatus::Cancelled {
            *lock(&self.value) = None;
            self.status.send_replace(FutureStatus::Pending);
        }
    }

    /// Queue `callback`, or give it back when the state is already terminal.
    fn push_callback(&self, callback: DoneCallback) -> Option<DoneCallback> {
        let mut callbacks = lock(&self.callbacks);
        if self.status.borrow().is_terminal() {
            return Some(callback);
        }
        callbacks.push(callback);
        None
    }

    async fn terminal(&self) -> FutureStatus {
        let mut rx = self.status.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let status = match rx.wait_for(FutureStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    fn cached(&self) -> Option<Arc<Value>> {
        lock(&self.value).clone()
    }

    fn cache(&self, value: Arc<Value>) {
        *lock(&self.value) = Some(value);
    }
}

// ── TaskFuture ──────────────────────────────────────────────────────

/// A handle to the eventual result of one task.
pub struct TaskFuture {
    state: Arc<FutureState>,
    client: Arc<ClientInner>,
}

impl TaskFuture {
    /// Wrap a state whose reference count the caller already took.
    pub(crate) fn from_parts(state: Arc<FutureState>, client: Arc<ClientInner>) -> Self {
        Self { state, client }
    }

    pub fn key(&self) -> &TaskKey {
        self.state.key()
    }

    pub fn status(&self) -> FutureStatus {
        self.state.status()
    }

    /// Finished, failed or cancelled.
    pub fn done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn cancelled(&self) -> bool {
        self.status() == FutureStatus::Cancelled
    }

    /// Wait until the future is done, however it ended.
    pub async fn wait(&self) {
        self.state.terminal().await;
    }

    /// The task's value, fetched from a worker on first use and cached.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<Value, ClientError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetch_result())
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => self.fetch_result().await,
        }
    }

    async fn fetch_result(&self) -> Result<Value, ClientError> {
        loop {
            match self.state.terminal().await {
                FutureStatus::Finished => {}
                FutureStatus::Error(error) => return Err(ClientError::Task(error)),
                FutureStatus::Cancelled => return Err(ClientError::Cancelled(self.key().clone())),
                FutureStatus::Pending => continue,
            }
            if let Some(value) = self.state.cached() {
                return Ok(Value::clone(&value));
            }
            match self.client.fetch(self.key()).await? {
                Some(value) => {
                    self.state.cache(value.clone());
                    return Ok(Value::clone(&value));
                }
                // Every holder vanished; wait for the recomputation.
                None if self.status() == FutureStatus::Pending => continue,
                None if self.status() == FutureStatus::Finished => {
                    return Err(ClientError::Unavailable(self.key().clone()))
                }
                None => continue,
            }
        }
    }

    /// The user exception the task raised, or `None` if it succeeded.
    pub async fn exception(&self, timeout: Option<Duration>) -> Result<Option<TaskError>, ClientError> {
        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.state.terminal())
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => self.state.terminal().await,
        };
        match status {
            FutureStatus::Error(error) => Ok(Some(error)),
            FutureStatus::Cancelled => Err(ClientError::Cancelled(self.key().clone())),
            _ => Ok(None),
        }
    }

    /// Ask the scheduler to stop working on this key. A finished future keeps
    /// its result.
    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.client.cancel(std::slice::from_ref(self), false).await
    }

    /// Run `callback` once the future is done.
    ///
    /// The callback runs exactly once, on the blocking pool, and receives a
    /// handle to this future. If the future is already done it is scheduled
    /// right away.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(TaskFuture) + Send + 'static,
    {
        if let Some(callback) = self.state.push_callback(Box::new(callback)) {
            self.client.run_callback(callback, self.clone());
        }
    }

    pub fn downgrade(&self) -> WeakFuture {
        WeakFuture {
            state: Arc::downgrade(&self.state),
            client: Arc::downgrade(&self.client),
        }
    }
}

impl Clone for TaskFuture {
    fn clone(&self) -> Self {
        self.client.retain(self.key());
        Self {
            state: self.state.clone(),
            client: self.client.clone(),
        }
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        self.client.release(self.key());
    }
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("key", self.key())
            .field("status", &self.status().as_str())
            .finish()
    }
}

impl PartialEq for TaskFuture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl From<&TaskFuture> for Arg {
    fn from(future: &TaskFuture) -> Self {
        Arg::Future(future.key().clone())
    }
}

/// A handle that does not keep its key wanted.
#[derive(Clone)]
pub struct WeakFuture {
    state: Weak<FutureState>,
    client: Weak<ClientInner>,
}

impl WeakFuture {
    /// A strong handle, if some other handle still keeps the key wanted.
    pub fn upgrade(&self) -> Option<TaskFuture> {
        let state = self.state.upgrade()?;
        let client = self.client.upgrade()?;
        client
            .retain_if_tracked(&state)
            .then(|| TaskFuture::from_parts(state, client))
    }
}
