//! The user-facing client: submits work, tracks futures and queries the
//! scheduler.
//!
//! A background reactor owns the client's endpoint. It turns scheduler
//! notifications into future state changes and keeps polling the inbox so
//! replies to requests made from any task get routed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive_comm::{Endpoint, EndpointHandle, Message, Network};
use hive_core::protocol::{
    DataResponse, SchedulerQuery, SchedulerReply, ToClient, ToScheduler, ToWorker, WhoHas, WorkerInfo,
};
use hive_core::{
    stimulus_id, Address, Arg, ClientConfig, Function, FunctionRegistry, Restrictions, RunSpec,
    TaskKey, TaskSpec, TaskStatus,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::executor::Executor;
use crate::future::{lock, DoneCallback, FutureState, FutureStatus, TaskFuture};

/// Pause between attempts to fetch a finished result.
const GATHER_BACKOFF: Duration = Duration::from_millis(50);

// ── Submit options ──────────────────────────────────────────────────

/// Per-submission settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOptions {
    /// Use this key instead of deriving one.
    pub key: Option<TaskKey>,
    /// Restrict execution to these workers.
    pub workers: Option<Vec<Address>>,
    /// Treat `workers` as a preference.
    pub allow_other_workers: bool,
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Derive the key from the call so identical calls share one result.
    pub pure: bool,
    /// Higher runs earlier.
    pub priority: i64,
    /// Abstract resources held while the task runs.
    pub resources: BTreeMap<String, f64>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            key: None,
            workers: None,
            allow_other_workers: false,
            retries: 0,
            pure: true,
            priority: 0,
            resources: BTreeMap::new(),
        }
    }
}

impl SubmitOptions {
    fn key_for(&self, function: &str, args: &[Arg], kwargs: &BTreeMap<String, Arg>) -> TaskKey {
        match &self.key {
            Some(key) => key.clone(),
            None if self.pure => TaskKey::pure(function, args, kwargs),
            None => TaskKey::unique(function),
        }
    }

    fn restrictions(&self) -> Restrictions {
        Restrictions {
            workers: self
                .workers
                .as_ref()
                .map(|workers| workers.iter().cloned().collect::<BTreeSet<_>>()),
            allow_other_workers: self.allow_other_workers,
            resources: self.resources.clone(),
        }
    }

    fn spec(&self, key: TaskKey, run_spec: RunSpec) -> TaskSpec {
        TaskSpec::new(key, run_spec)
            .with_retries(self.retries)
            .with_priority(-self.priority)
            .with_restrictions(self.restrictions())
    }
}

// ── Builder ─────────────────────────────────────────────────────────

pub struct ClientBuilder {
    network: Network,
    registry: FunctionRegistry,
    scheduler: Address,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn scheduler(mut self, scheduler: Address) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the reactor and register with the scheduler.
    pub async fn connect(self) -> Result<Client, ClientError> {
        let endpoint = self.network.listen(Address::fresh_client())?;
        let shutdown = Arc::new(Notify::new());
        let inner = Arc::new(ClientInner {
            handle: endpoint.handle(),
            scheduler: self.scheduler,
            registry: self.registry,
            config: self.config,
            runtime: Handle::current(),
            futures: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            reactor: Mutex::new(None),
        });

        let join = tokio::spawn(run_reactor(Arc::downgrade(&inner), endpoint, shutdown));
        *lock(&inner.reactor) = Some(join);

        let client = Client { inner };
        match client.request(ToScheduler::RegisterClient).await? {
            SchedulerReply::Ack => {}
            other => return Err(unexpected(other)),
        }
        info!(client = %client.address(), scheduler = %client.inner.scheduler, "client connected");
        Ok(client)
    }
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(network: &Network, registry: &FunctionRegistry) -> ClientBuilder {
        ClientBuilder {
            network: network.clone(),
            registry: registry.clone(),
            scheduler: Address::scheduler(),
            config: ClientConfig::default(),
        }
    }

    /// Connect to the scheduler at its well-known address with default settings.
    pub async fn connect(network: &Network, registry: &FunctionRegistry) -> Result<Client, ClientError> {
        Self::builder(network, registry).connect().await
    }

    pub fn address(&self) -> &Address {
        self.inner.handle.address()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Submit `function(*args)` with default options.
    pub fn submit(&self, function: &Function, args: Vec<Arg>) -> Result<TaskFuture, ClientError> {
        self.submit_with(function, args, BTreeMap::new(), &SubmitOptions::default())
    }

    pub fn submit_with(
        &self,
        function: &Function,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
        options: &SubmitOptions,
    ) -> Result<TaskFuture, ClientError> {
        self.ensure_open()?;
        self.inner.registry.register(function)?;
        let key = options.key_for(function.name(), &args, &kwargs);
        let spec = options.spec(key.clone(), RunSpec::new(function.name(), args, kwargs));
        let mut futures = self.submit_specs(vec![spec])?;
        futures.pop().ok_or_else(|| ClientError::UnexpectedReply(format!("no future for {key}")))
    }

    /// Submit one call per position across `iterables`, stopping at the
    /// shortest one.
    pub fn map(
        &self,
        function: &Function,
        iterables: Vec<Vec<Arg>>,
        options: &SubmitOptions,
    ) -> Result<Vec<TaskFuture>, ClientError> {
        let calls = transpose(iterables);
        let per_call = SubmitOptions {
            key: None,
            ..options.clone()
        };
        let keys = calls
            .iter()
            .map(|args| per_call.key_for(function.name(), args, &BTreeMap::new()))
            .collect();
        self.map_with_keys(function, keys, calls, &per_call)
    }

    /// Like [`Client::map`] but each call is given an explicit key; `calls`
    /// holds the argument list of every call.
    pub fn map_with_keys(
        &self,
        function: &Function,
        keys: Vec<TaskKey>,
        calls: Vec<Vec<Arg>>,
        options: &SubmitOptions,
    ) -> Result<Vec<TaskFuture>, ClientError> {
        self.ensure_open()?;
        self.inner.registry.register(function)?;
        let specs = keys
            .into_iter()
            .zip(calls)
            .map(|(key, args)| options.spec(key, RunSpec::new(function.name(), args, BTreeMap::new())))
            .collect();
        self.submit_specs(specs)
    }

    fn submit_specs(&self, tasks: Vec<TaskSpec>) -> Result<Vec<TaskFuture>, ClientError> {
        let wanted: Vec<TaskKey> = tasks.iter().map(|spec| spec.key.clone()).collect();
        // Track first so an immediate answer finds its future.
        let futures: Vec<TaskFuture> = wanted.iter().map(|key| self.inner.track(key)).collect();
        debug!(client = %self.address(), tasks = tasks.len(), "submitting graph");
        self.inner.send(&ToScheduler::SubmitGraph {
            tasks,
            wanted,
            stimulus_id: stimulus_id("submit"),
        })?;
        Ok(futures)
    }

    // ── Results ─────────────────────────────────────────────────────

    /// Results of `futures`, in order. The first failure is returned.
    pub async fn gather(&self, futures: &[TaskFuture]) -> Result<Vec<Value>, ClientError> {
        let mut values = Vec::with_capacity(futures.len());
        for future in futures {
            values.push(future.result(None).await?);
        }
        Ok(values)
    }

    /// Cancel every future in `futures` that is not done yet. With `force`
    /// the keys are cancelled for every client that wants them.
    pub async fn cancel(&self, futures: &[TaskFuture], force: bool) -> Result<(), ClientError> {
        self.inner.cancel(futures, force).await
    }

    /// Drop all cluster state and replace every worker.
    ///
    /// Every future of every client is cancelled. Returns once the workers
    /// are back or the restart timeout passed.
    pub async fn restart(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let restart_timeout = self.inner.config.restart_timeout();
        let msg = ToScheduler::Restart {
            timeout_ms: restart_timeout.as_millis() as u64,
        };
        let reply: SchedulerReply = self
            .inner
            .handle
            .request(
                &self.inner.scheduler,
                msg.op(),
                &msg,
                restart_timeout + self.inner.config.request_timeout(),
            )
            .await?;
        for key in self.inner.tracked_keys() {
            self.inner.set_status(&key, FutureStatus::Cancelled);
        }
        match reply {
            SchedulerReply::Restarted {
                complete: true,
                workers,
                ..
            } => {
                info!(client = %self.address(), workers, "cluster restarted");
                Ok(())
            }
            SchedulerReply::Restarted {
                workers, expected, ..
            } => Err(ClientError::RestartIncomplete { workers, expected }),
            other => Err(unexpected(other)),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Holders of `keys`, or of every key in memory when `None`.
    pub async fn who_has(&self, keys: Option<&[TaskKey]>) -> Result<WhoHas, ClientError> {
        let query = SchedulerQuery::WhoHas {
            keys: keys.map(<[TaskKey]>::to_vec),
        };
        match self.query(query).await? {
            SchedulerReply::WhoHas(who_has) => Ok(who_has),
            other => Err(unexpected(other)),
        }
    }

    pub async fn has_what(&self) -> Result<BTreeMap<Address, Vec<TaskKey>>, ClientError> {
        match self.query(SchedulerQuery::HasWhat).await? {
            SchedulerReply::HasWhat(has_what) => Ok(has_what),
            other => Err(unexpected(other)),
        }
    }

    pub async fn processing(&self) -> Result<BTreeMap<Address, Vec<TaskKey>>, ClientError> {
        match self.query(SchedulerQuery::Processing).await? {
            SchedulerReply::Processing(processing) => Ok(processing),
            other => Err(unexpected(other)),
        }
    }

    pub async fn task_states(&self) -> Result<BTreeMap<TaskKey, TaskStatus>, ClientError> {
        match self.query(SchedulerQuery::TaskStates).await? {
            SchedulerReply::TaskStates(states) => Ok(states),
            other => Err(unexpected(other)),
        }
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, ClientError> {
        match self.query(SchedulerQuery::Workers).await? {
            SchedulerReply::Workers(workers) => Ok(workers),
            other => Err(unexpected(other)),
        }
    }

    /// Wait until at least `n` workers are registered.
    pub async fn wait_for_workers(&self, n: usize, timeout: Option<Duration>) -> Result<(), ClientError> {
        let poll = async {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                interval.tick().await;
                if self.workers().await?.len() >= n {
                    return Ok::<_, ClientError>(());
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, poll)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => poll.await,
        }
    }

    // ── Executors ───────────────────────────────────────────────────

    /// An executor whose submissions share `options`.
    ///
    /// Recognised options are `workers`, `retries`, `pure`,
    /// `allow_other_workers`, `priority` and `resources`; anything else is
    /// rejected, naming every unrecognised key.
    pub fn get_executor<K, I>(&self, options: I) -> Result<Executor, ClientError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let options = options.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Executor::new(self.clone(), options)
    }

    /// An executor with default options.
    pub fn executor(&self) -> Executor {
        Executor::with_options(self.clone(), SubmitOptions::default())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Release everything this client wants and stop the reactor. Futures
    /// that are not done become cancelled.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.send(&ToScheduler::CloseClient) {
            debug!(client = %self.address(), error = %e, "scheduler gone before close");
        }
        for key in self.inner.tracked_keys() {
            if let Some(state) = self.inner.state_of(&key) {
                if !state.status().is_terminal() {
                    self.inner.set_status(&key, FutureStatus::Cancelled);
                }
            }
        }
        self.inner.shutdown.notify_one();
        let join = lock(&self.inner.reactor).take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(client = %self.address(), error = %e, "client reactor ended abnormally");
            }
        }
        info!(client = %self.address(), "client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    async fn query(&self, query: SchedulerQuery) -> Result<SchedulerReply, ClientError> {
        self.request(ToScheduler::Query(query)).await
    }

    async fn request(&self, msg: ToScheduler) -> Result<SchedulerReply, ClientError> {
        self.inner.request(msg).await
    }
}

/// `[[a0, a1], [b0, b1]]` → `[[a0, b0], [a1, b1]]`, cut to the shortest input.
fn transpose(iterables: Vec<Vec<Arg>>) -> Vec<Vec<Arg>> {
    let len = iterables.iter().map(Vec::len).min().unwrap_or(0);
    let mut columns: Vec<std::vec::IntoIter<Arg>> = iterables.into_iter().map(Vec::into_iter).collect();
    (0..len)
        .map(|_| columns.iter_mut().filter_map(Iterator::next).collect())
        .collect()
}

fn unexpected(reply: SchedulerReply) -> ClientError {
    match reply {
        SchedulerReply::Error(message) => ClientError::UnexpectedReply(message),
        other => ClientError::UnexpectedReply(format!("{other:?}")),
    }
}

// ── Shared state ────────────────────────────────────────────────────

struct Tracked {
    state: Arc<FutureState>,
    refs: usize,
}

pub(crate) struct ClientInner {
    handle: EndpointHandle,
    scheduler: Address,
    registry: FunctionRegistry,
    config: ClientConfig,
    runtime: Handle,
    futures: Mutex<HashMap<TaskKey, Tracked>>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    /// A new handle for `key`, creating its state on first use.
    fn track(self: &Arc<Self>, key: &TaskKey) -> TaskFuture {
        let state = {
            let mut futures = lock(&self.futures);
            let tracked = futures.entry(key.clone()).or_insert_with(|| Tracked {
                state: FutureState::new(key.clone()),
                refs: 0,
            });
            tracked.refs += 1;
            tracked.state.clone()
        };
        state.reset();
        TaskFuture::from_parts(state, self.clone())
    }

    pub(crate) fn retain(&self, key: &TaskKey) {
        if let Some(tracked) = lock(&self.futures).get_mut(key) {
            tracked.refs += 1;
        }
    }

    /// Take a reference on `state` if it is still the tracked state of its key.
    pub(crate) fn retain_if_tracked(&self, state: &Arc<FutureState>) -> bool {
        match lock(&self.futures).get_mut(state.key()) {
            Some(tracked) if Arc::ptr_eq(&tracked.state, state) && tracked.refs > 0 => {
                tracked.refs += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop one reference; the last one tells the scheduler the key is no
    /// longer wanted.
    pub(crate) fn release(&self, key: &TaskKey) {
        let released = {
            let mut futures = lock(&self.futures);
            match futures.get_mut(key) {
                Some(tracked) if tracked.refs > 1 => {
                    tracked.refs -= 1;
                    false
                }
                Some(_) => {
                    futures.remove(key);
                    true
                }
                None => false,
            }
        };
        if released && !self.closed.load(Ordering::SeqCst) {
            debug!(client = %self.handle.address(), key = %key, "releasing key");
            let msg = ToScheduler::ClientReleasesKeys {
                keys: vec![key.clone()],
                stimulus_id: stimulus_id("client-releases-keys"),
            };
            if let Err(e) = self.send(&msg) {
                debug!(key = %key, error = %e, "could not release key");
            }
        }
    }

    fn state_of(&self, key: &TaskKey) -> Option<Arc<FutureState>> {
        lock(&self.futures).get(key).map(|tracked| tracked.state.clone())
    }

    fn tracked_keys(&self) -> Vec<TaskKey> {
        lock(&self.futures).keys().cloned().collect()
    }

    /// Move the state of `key` and run the callbacks that became due.
    pub(crate) fn set_status(self: &Arc<Self>, key: &TaskKey, status: FutureStatus) {
        let Some(state) = self.state_of(key) else {
            return;
        };
        let callbacks = state.set(status);
        if callbacks.is_empty() {
            return;
        }
        for callback in callbacks {
            if !self.retain_if_tracked(&state) {
                break;
            }
            let future = TaskFuture::from_parts(state.clone(), self.clone());
            self.run_callback(callback, future);
        }
    }

    pub(crate) fn run_callback(&self, callback: DoneCallback, future: TaskFuture) {
        self.runtime.spawn_blocking(move || callback(future));
    }

    pub(crate) async fn cancel(self: &Arc<Self>, futures: &[TaskFuture], force: bool) -> Result<(), ClientError> {
        let keys: Vec<TaskKey> = futures
            .iter()
            .filter(|future| !future.done())
            .map(|future| future.key().clone())
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        let msg = ToScheduler::CancelKeys {
            keys: keys.clone(),
            force,
            stimulus_id: stimulus_id("client-cancel"),
        };
        match self.request(msg).await? {
            SchedulerReply::Ack => {}
            other => return Err(unexpected(other)),
        }
        // Keys the scheduler never saw get no cancelled-keys message.
        for key in &keys {
            self.set_status(key, FutureStatus::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn send(&self, msg: &ToScheduler) -> Result<(), ClientError> {
        self.handle.send(&self.scheduler, msg.op(), msg)?;
        Ok(())
    }

    async fn request(&self, msg: ToScheduler) -> Result<SchedulerReply, ClientError> {
        let reply = self
            .handle
            .request(&self.scheduler, msg.op(), &msg, self.config.request_timeout())
            .await?;
        Ok(reply)
    }

    /// Fetch the value of a finished key from whichever worker holds it.
    ///
    /// Returns `None` when no holder delivered it within the configured
    /// number of attempts.
    pub(crate) async fn fetch(&self, key: &TaskKey) -> Result<Option<Arc<Value>>, ClientError> {
        let attempts = self.config.gather_attempts.max(1);
        for attempt in 1..=attempts {
            let query = ToScheduler::Query(SchedulerQuery::WhoHas {
                keys: Some(vec![key.clone()]),
            });
            let holders = match self.request(query).await? {
                SchedulerReply::WhoHas(mut who_has) => who_has.remove(key).unwrap_or_default(),
                other => return Err(unexpected(other)),
            };
            for holder in &holders {
                let msg = ToWorker::GetData {
                    keys: vec![key.clone()],
                };
                match self
                    .handle
                    .request::<_, DataResponse>(holder, msg.op(), &msg, self.config.request_timeout())
                    .await
                {
                    Ok(mut response) => {
                        if let Some(value) = response.data.remove(key) {
                            return Ok(Some(Arc::new(value)));
                        }
                        debug!(key = %key, worker = %holder, "holder no longer has the key");
                    }
                    Err(e) => debug!(key = %key, worker = %holder, error = %e, "fetch from holder failed"),
                }
            }
            debug!(key = %key, attempt, holders = holders.len(), "result not available yet");
            tokio::time::sleep(GATHER_BACKOFF * attempt).await;
        }
        warn!(key = %key, attempts, "giving up fetching result");
        Ok(None)
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        let msg: ToClient = match message.decode() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(op = %message.op, sender = %message.sender, error = %e, "undecodable message");
                return;
            }
        };
        debug!(client = %self.handle.address(), op = msg.op(), "client received");
        match msg {
            ToClient::KeyInMemory { key } => self.set_status(&key, FutureStatus::Finished),
            ToClient::TaskErred { key, error, blame } => {
                debug!(key = %key, blame = %blame, error = %error, "task erred");
                self.set_status(&key, FutureStatus::Error(error));
            }
            ToClient::CancelledKeys { keys } => {
                for key in &keys {
                    self.set_status(key, FutureStatus::Cancelled);
                }
            }
            ToClient::LostData { key } => {
                let lost = self
                    .state_of(&key)
                    .is_some_and(|state| state.status() == FutureStatus::Finished);
                if lost {
                    info!(key = %key, "result lost, waiting for recomputation");
                    self.set_status(&key, FutureStatus::Pending);
                }
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn run_reactor(
    inner: std::sync::Weak<ClientInner>,
    mut endpoint: Endpoint,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            message = endpoint.recv() => {
                let Some(message) = message else {
                    warn!(client = %endpoint.address(), "client endpoint closed");
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_message(message);
            }
        }
    }
    debug!(client = %endpoint.address(), "client reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_stops_at_the_shortest_input() {
        let calls = transpose(vec![
            vec![Arg::from(1), Arg::from(2), Arg::from(3)],
            vec![Arg::from(10), Arg::from(20)],
        ]);
        assert_eq!(
            calls,
            vec![vec![Arg::from(1), Arg::from(10)], vec![Arg::from(2), Arg::from(20)]]
        );
    }

    #[test]
    fn pure_keys_follow_the_call() {
        let options = SubmitOptions::default();
        let a = options.key_for("inc", &[Arg::from(1)], &BTreeMap::new());
        let b = options.key_for("inc", &[Arg::from(1)], &BTreeMap::new());
        let c = options.key_for("inc", &[Arg::from(2)], &BTreeMap::new());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn impure_keys_are_fresh() {
        let options = SubmitOptions {
            pure: false,
            ..SubmitOptions::default()
        };
        let a = options.key_for("random", &[], &BTreeMap::new());
        let b = options.key_for("random", &[], &BTreeMap::new());
        assert_ne!(a, b);
        assert_eq!(a.prefix(), "random");
    }

    #[test]
    fn explicit_key_wins() {
        let options = SubmitOptions {
            key: Some(TaskKey::new("mine")),
            pure: false,
            ..SubmitOptions::default()
        };
        assert_eq!(options.key_for("inc", &[], &BTreeMap::new()), TaskKey::new("mine"));
    }

    #[test]
    fn higher_priority_sorts_first() {
        let urgent = SubmitOptions {
            priority: 10,
            ..SubmitOptions::default()
        };
        let spec = urgent.spec(TaskKey::new("x"), RunSpec::new("inc", vec![], BTreeMap::new()));
        assert_eq!(spec.priority, -10);
        assert!(spec.restrictions.is_empty());
    }

    #[test]
    fn worker_restrictions_are_attached() {
        let options = SubmitOptions {
            workers: Some(vec![Address::inproc("w1")]),
            retries: 2,
            ..SubmitOptions::default()
        };
        let spec = options.spec(TaskKey::new("x"), RunSpec::new("inc", vec![], BTreeMap::new()));
        assert_eq!(spec.retries, 2);
        assert_eq!(
            spec.restrictions.workers,
            Some(BTreeSet::from([Address::inproc("w1")]))
        );
    }
}
