//! The worker's control loop.
//!
//! One tokio task owns the [`WorkerStateMachine`]. Scheduler messages,
//! finished executions and finished gathers all arrive as events; the
//! instructions the machine returns are carried out here: task bodies go to
//! the [`ExecutionPool`], transfers to spawned tokio tasks, and messages to
//! the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_comm::{Endpoint, EndpointHandle, Message, Network};
use hive_core::protocol::{ToScheduler, ToWorker};
use hive_core::{
    stimulus_id, Address, FunctionRegistry, SchedulerConfig, TaskCall, TaskError, TaskKey,
    WorkerConfig,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::machine::{Instruction, WorkerEvent, WorkerStateMachine};
use crate::peer::{gather_from_peer, NetworkPeers, PeerTransport};
use crate::pool::ExecutionPool;

// ── Builder ─────────────────────────────────────────────────────────

pub struct WorkerBuilder {
    network: Network,
    registry: FunctionRegistry,
    scheduler: Address,
    address: Option<Address>,
    config: WorkerConfig,
    heartbeat_interval: Duration,
    peers: Option<Arc<dyn PeerTransport>>,
}

impl WorkerBuilder {
    pub fn new(network: &Network, registry: &FunctionRegistry) -> Self {
        Self {
            network: network.clone(),
            registry: registry.clone(),
            scheduler: Address::scheduler(),
            address: None,
            config: WorkerConfig::default(),
            heartbeat_interval: SchedulerConfig::default().heartbeat_interval(),
            peers: None,
        }
    }

    pub fn scheduler(mut self, scheduler: Address) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Listen at `address` instead of a fresh one.
    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Replace the network transport used for peer transfers.
    pub fn peers(mut self, peers: Arc<dyn PeerTransport>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Register with the scheduler and start the control loop.
    pub fn start(self) -> Result<WorkerHandle, WorkerError> {
        let address = self.address.unwrap_or_else(Address::fresh_worker);
        let pool = ExecutionPool::new(self.config.nthreads, self.config.long_running_threads)?;
        let endpoint = self.network.listen(address.clone())?;
        let handle = endpoint.handle();

        let register = ToScheduler::RegisterWorker {
            nthreads: self.config.nthreads,
            resources: self.config.resources.clone(),
        };
        handle.send(&self.scheduler, register.op(), &register)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peers = self
            .peers
            .unwrap_or_else(|| Arc::new(NetworkPeers::new(handle.clone())));
        let runtime = Runtime {
            machine: WorkerStateMachine::new(address.clone(), &self.config),
            handle,
            scheduler: self.scheduler,
            registry: self.registry,
            pool,
            peers,
            events: events_tx,
            gathers: HashMap::new(),
            config: self.config,
        };

        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(runtime.run(
            endpoint,
            events_rx,
            shutdown.clone(),
            self.heartbeat_interval,
        ));
        info!(worker = %address, "worker started");

        Ok(WorkerHandle {
            address,
            shutdown,
            join,
        })
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Why a worker's control loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Closed by its owner.
    Closed,
    /// Told to stop by the scheduler.
    Terminated(String),
    /// Its endpoint was killed.
    Killed,
}

pub struct WorkerHandle {
    address: Address,
    shutdown: Arc<Notify>,
    join: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Unregister from the scheduler and stop.
    pub async fn close(self) -> WorkerExit {
        self.shutdown.notify_one();
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(worker = %self.address, error = %e, "worker task ended abnormally");
                WorkerExit::Killed
            }
        }
    }

    /// Wait until the worker stops on its own. Cancel safe.
    pub async fn closed(&mut self) -> WorkerExit {
        match (&mut self.join).await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(worker = %self.address, error = %e, "worker task ended abnormally");
                WorkerExit::Killed
            }
        }
    }
}

// ── Runtime ─────────────────────────────────────────────────────────

struct Runtime {
    handle: EndpointHandle,
    scheduler: Address,
    machine: WorkerStateMachine,
    registry: FunctionRegistry,
    pool: ExecutionPool,
    peers: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    gathers: HashMap<u64, JoinHandle<()>>,
    config: WorkerConfig,
}

impl Runtime {
    async fn run(
        mut self,
        mut endpoint: Endpoint,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        shutdown: Arc<Notify>,
        heartbeat_interval: Duration,
    ) -> WorkerExit {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(self.config.missing_retry());
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = shutdown.notified() => break WorkerExit::Closed,
                message = endpoint.recv() => match message {
                    Some(message) => {
                        if let Some(exit) = self.handle_message(message) {
                            break exit;
                        }
                    }
                    None => break WorkerExit::Killed,
                },
                Some(event) = events.recv() => self.dispatch(event),
                _ = heartbeat.tick() => {
                    let metrics = self.machine.metrics();
                    self.send(ToScheduler::Heartbeat { metrics });
                }
                _ = retry.tick() => self.dispatch(WorkerEvent::RetryMissing {
                    stimulus_id: stimulus_id("retry-missing"),
                }),
            }
        };

        for (_, gather) in self.gathers.drain() {
            gather.abort();
        }
        if exit == WorkerExit::Closed {
            self.send(ToScheduler::UnregisterWorker {
                stimulus_id: stimulus_id("worker-close"),
            });
        }
        info!(worker = %self.handle.address(), exit = ?exit, "worker stopped");
        exit
    }

    fn handle_message(&mut self, message: Message) -> Option<WorkerExit> {
        let op: ToWorker = match message.decode() {
            Ok(op) => op,
            Err(e) => {
                warn!(op = %message.op, sender = %message.sender, error = %e, "undecodable message");
                return None;
            }
        };
        debug!(worker = %self.handle.address(), op = op.op(), "worker received");

        let event = match op {
            ToWorker::Terminate { reason } => {
                info!(worker = %self.handle.address(), reason = %reason, "terminated by scheduler");
                return Some(WorkerExit::Terminated(reason));
            }
            ToWorker::GetData { keys } => {
                self.serve_data(message, &keys);
                return None;
            }
            ToWorker::ComputeTask {
                key,
                run_spec,
                who_has,
                nbytes,
                priority,
                resources,
                stimulus_id,
            } => WorkerEvent::ComputeTask {
                key,
                run_spec,
                who_has,
                nbytes,
                priority,
                resources,
                stimulus_id,
            },
            ToWorker::FreeKeys { keys, stimulus_id } => WorkerEvent::FreeKeys { keys, stimulus_id },
            ToWorker::RefreshWhoHas {
                who_has,
                stimulus_id,
            } => WorkerEvent::RefreshWhoHas {
                who_has,
                stimulus_id,
            },
            ToWorker::WorkerRemoved {
                address,
                stimulus_id,
            } => WorkerEvent::WorkerRemoved {
                address,
                stimulus_id,
            },
        };
        self.dispatch(event);
        None
    }

    /// Answer a peer's or client's `get-data` request without blocking the loop.
    fn serve_data(&self, request: Message, keys: &[TaskKey]) {
        let (response, size) = self.machine.get_data(keys);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.reply_offloaded(&request, response, size).await {
                debug!(to = %request.sender, error = %e, "dropping data reply");
            }
        });
    }

    fn dispatch(&mut self, event: WorkerEvent) {
        if let WorkerEvent::GatherSuccess { gather_id, .. } | WorkerEvent::GatherFailed { gather_id, .. } = &event {
            self.gathers.remove(gather_id);
        }
        for instruction in self.machine.handle(event) {
            self.apply(instruction);
        }
    }

    fn apply(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Send(msg) => self.send(msg),
            Instruction::Gather {
                gather_id,
                worker,
                keys,
                stimulus_id: _,
            } => {
                let peers = self.peers.clone();
                let events = self.events.clone();
                let attempts = self.config.connect_attempts;
                let timeout = self.config.connect_timeout();
                let task = tokio::spawn(async move {
                    let event = match gather_from_peer(peers.as_ref(), &worker, &keys, attempts, timeout).await {
                        Ok(response) => WorkerEvent::GatherSuccess {
                            gather_id,
                            response,
                            stimulus_id: stimulus_id("gather-dep-success"),
                        },
                        Err(e) => {
                            debug!(peer = %worker, error = %e, "gather failed");
                            WorkerEvent::GatherFailed {
                                gather_id,
                                stimulus_id: stimulus_id("gather-dep-failed"),
                            }
                        }
                    };
                    // The receiver is gone only once the worker stopped.
                    let _ = events.send(event);
                });
                self.gathers.insert(gather_id, task);
            }
            Instruction::AbortGather { gather_id } => {
                if let Some(task) = self.gathers.remove(&gather_id) {
                    task.abort();
                }
            }
            Instruction::Execute {
                key,
                function,
                args,
                kwargs,
                stimulus_id: _,
            } => {
                let Some(body) = self.registry.get(&function) else {
                    warn!(key = %key, function = %function, "unknown task function");
                    let _ = self.events.send(WorkerEvent::ExecuteFailure {
                        key,
                        error: TaskError::unknown_function(&function),
                        stimulus_id: stimulus_id("task-erred"),
                    });
                    return;
                };
                let seceder = {
                    let events = self.events.clone();
                    let key = key.clone();
                    move || {
                        let _ = events.send(WorkerEvent::Secede {
                            key: key.clone(),
                            stimulus_id: stimulus_id("secede"),
                        });
                    }
                };
                let call = TaskCall::new(key.clone(), args, kwargs).with_seceder(seceder);
                let events = self.events.clone();
                self.pool.execute(body, call, move |result, elapsed| {
                    let duration_ms = elapsed.as_millis() as u64;
                    let event = match result {
                        Ok(value) => WorkerEvent::ExecuteSuccess {
                            key,
                            value,
                            duration_ms,
                            stimulus_id: stimulus_id("task-finished"),
                        },
                        Err(error) => WorkerEvent::ExecuteFailure {
                            key,
                            error,
                            stimulus_id: stimulus_id("task-erred"),
                        },
                    };
                    let _ = events.send(event);
                });
            }
        }
    }

    fn send(&self, msg: ToScheduler) {
        if let Err(e) = self.handle.send(&self.scheduler, msg.op(), &msg) {
            debug!(op = msg.op(), error = %e, "dropping message to scheduler");
        }
    }
}
