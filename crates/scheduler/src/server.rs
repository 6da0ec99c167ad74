//! The scheduler's control loop.
//!
//! One tokio task owns the [`SchedulerState`]. It multiplexes the inbox,
//! network membership events, the heartbeat tick and a pending restart
//! deadline, feeds each event to the state machine, and flushes the outbox
//! before taking the next one.

use std::sync::Arc;

use hive_comm::{Endpoint, EndpointHandle, Message, Network, NetworkEvent};
use hive_core::protocol::{SchedulerReply, ToScheduler, ToWorker};
use hive_core::{stimulus_id, Address, SchedulerConfig};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::state::SchedulerState;

// ── Server ──────────────────────────────────────────────────────────

pub struct SchedulerServer;

impl SchedulerServer {
    /// Start a scheduler at the well-known [`Address::scheduler`].
    pub fn start(network: &Network, config: SchedulerConfig) -> Result<SchedulerHandle, SchedulerError> {
        Self::start_at(network, Address::scheduler(), config)
    }

    pub fn start_at(
        network: &Network,
        address: Address,
        config: SchedulerConfig,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let endpoint = network.listen(address.clone())?;
        let events = network.subscribe();
        let shutdown = Arc::new(Notify::new());

        let reactor = Reactor {
            handle: endpoint.handle(),
            state: SchedulerState::new(config),
            restart: None,
        };
        let join = tokio::spawn(reactor.run(endpoint, events, shutdown.clone()));
        info!(address = %address, "scheduler started");

        Ok(SchedulerHandle {
            address,
            shutdown,
            join,
        })
    }
}

/// Owner's handle to a running scheduler.
pub struct SchedulerHandle {
    address: Address,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Stop the control loop, terminating connected workers, and wait for it.
    pub async fn close(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

// ── Reactor ─────────────────────────────────────────────────────────

/// Clients waiting for terminated workers to come back.
struct RestartBarrier {
    requests: Vec<Message>,
    expected: usize,
    deadline: Instant,
}

struct Reactor {
    handle: EndpointHandle,
    state: SchedulerState,
    restart: Option<RestartBarrier>,
}

impl Reactor {
    async fn run(
        mut self,
        mut endpoint: Endpoint,
        mut events: broadcast::Receiver<NetworkEvent>,
        shutdown: Arc<Notify>,
    ) {
        let mut tick = tokio::time::interval(self.state.config().heartbeat_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let restart_deadline = self.restart.as_ref().map(|b| b.deadline);
            tokio::select! {
                _ = shutdown.notified() => break,
                message = endpoint.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        warn!("scheduler endpoint closed");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(NetworkEvent::Disconnected { address, killed }) => {
                        self.handle_disconnect(&address, killed);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "missed network events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => self.handle_tick(),
                _ = sleep_until_opt(restart_deadline) => self.finish_restart(false),
            }
            self.flush();
            self.check_restart();
        }

        for worker in self.state.workers().map(|ws| ws.address.clone()).collect::<Vec<_>>() {
            self.send(
                &worker,
                &ToWorker::Terminate {
                    reason: "scheduler closing".to_string(),
                },
            );
        }
        info!(address = %self.handle.address(), "scheduler stopped");
    }

    fn handle_message(&mut self, message: Message) {
        let op: ToScheduler = match message.decode() {
            Ok(op) => op,
            Err(e) => {
                warn!(op = %message.op, sender = %message.sender, error = %e, "undecodable message");
                if message.is_request() {
                    self.reply(&message, &SchedulerReply::Error(e.to_string()));
                }
                return;
            }
        };
        let sender = message.sender.clone();
        debug!(op = op.op(), sender = %sender, "scheduler received");

        match op {
            // Clients
            ToScheduler::RegisterClient => {
                self.state.add_client(&sender);
                self.reply(&message, &SchedulerReply::Ack);
            }
            ToScheduler::CloseClient => {
                self.state.remove_client(&sender, &stimulus_id("close-client"));
            }
            ToScheduler::SubmitGraph {
                tasks,
                wanted,
                stimulus_id,
            } => self.state.submit_graph(&sender, tasks, wanted, &stimulus_id),
            ToScheduler::ClientReleasesKeys { keys, stimulus_id } => {
                self.state.client_releases_keys(&sender, &keys, &stimulus_id);
            }
            ToScheduler::CancelKeys {
                keys,
                force,
                stimulus_id,
            } => {
                self.state.cancel_keys(&sender, &keys, force, &stimulus_id);
                // cancelled-keys must reach the client before the ack.
                self.flush();
                self.reply(&message, &SchedulerReply::Ack);
            }
            ToScheduler::Restart { timeout_ms } => self.begin_restart(message, timeout_ms),
            ToScheduler::Query(query) => {
                let reply = self.state.query(&query);
                self.reply(&message, &reply);
            }

            // Workers
            ToScheduler::RegisterWorker {
                nthreads,
                resources,
            } => {
                self.state.add_worker(
                    &sender,
                    nthreads,
                    resources,
                    now(),
                    &stimulus_id("register-worker"),
                );
                if message.is_request() {
                    let interval = self.state.config().heartbeat_interval_ms;
                    self.reply(
                        &message,
                        &SchedulerReply::Registered {
                            heartbeat_interval_ms: interval,
                        },
                    );
                }
            }
            op if !self.state.is_worker(&sender) => {
                debug!(op = op.op(), sender = %sender, "ignoring message from unknown worker");
            }
            ToScheduler::UnregisterWorker { stimulus_id } => {
                self.state
                    .remove_worker(&sender, "worker closed", &stimulus_id);
            }
            ToScheduler::Heartbeat { metrics } => {
                self.state.heartbeat(&sender, metrics, now());
            }
            ToScheduler::TaskFinished {
                key,
                nbytes,
                duration_ms,
                stimulus_id,
            } => self
                .state
                .task_finished(&sender, &key, nbytes, duration_ms, &stimulus_id),
            ToScheduler::TaskErred {
                key,
                error,
                stimulus_id,
            } => self.state.task_erred(&sender, &key, error, &stimulus_id),
            ToScheduler::MissingData {
                key,
                errant_worker,
                stimulus_id,
            } => self.state.missing_data(&key, &errant_worker, &stimulus_id),
            ToScheduler::AddKeys { keys, stimulus_id } => {
                self.state.add_keys(&sender, &keys, &stimulus_id);
            }
            ToScheduler::RequestWhoHas { keys } => {
                self.state
                    .request_who_has(&sender, &keys, &stimulus_id("request-who-has"));
            }
            ToScheduler::LongRunning { key, .. } => self.state.long_running(&sender, &key),
        }
    }

    fn handle_disconnect(&mut self, address: &Address, killed: bool) {
        let sid = stimulus_id("disconnect");
        if self.state.is_worker(address) {
            let reason = if killed { "worker killed" } else { "connection closed" };
            self.state.remove_worker(address, reason, &sid);
        } else if self.state.is_client(address) {
            self.state.remove_client(address, &sid);
        }
    }

    fn handle_tick(&mut self) {
        let expired = self.state.expired_workers(now());
        if expired.is_empty() {
            return;
        }
        let sid = stimulus_id("worker-ttl");
        for worker in expired {
            warn!(worker = %worker, "worker missed heartbeats, removing");
            self.state.remove_worker(&worker, "heartbeat timeout", &sid);
            self.send(
                &worker,
                &ToWorker::Terminate {
                    reason: "heartbeat timeout".to_string(),
                },
            );
        }
    }

    // ── Restart ─────────────────────────────────────────────────────

    fn begin_restart(&mut self, request: Message, timeout_ms: u64) {
        if let Some(barrier) = &mut self.restart {
            barrier.requests.push(request);
            return;
        }
        let expected = self.state.restart(&stimulus_id("restart"));
        self.restart = Some(RestartBarrier {
            requests: vec![request],
            expected,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        });
    }

    fn check_restart(&mut self) {
        let done = self
            .restart
            .as_ref()
            .is_some_and(|b| self.state.workers().count() >= b.expected);
        if done {
            self.finish_restart(true);
        }
    }

    fn finish_restart(&mut self, complete: bool) {
        let Some(barrier) = self.restart.take() else {
            return;
        };
        let workers = self.state.workers().count();
        if complete {
            info!(workers, "restart complete");
        } else {
            warn!(workers, expected = barrier.expected, "restart timed out waiting for workers");
        }
        let reply = SchedulerReply::Restarted {
            workers,
            expected: barrier.expected,
            complete,
        };
        for request in &barrier.requests {
            self.reply(request, &reply);
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Deliver everything the state machine produced, in order.
    fn flush(&mut self) {
        let outbox = self.state.take_outbox();
        for (to, msg) in &outbox.workers {
            self.send_op(to, msg.op(), msg);
        }
        for (to, msg) in &outbox.clients {
            self.send_op(to, msg.op(), msg);
        }
        if self.state.config().validate {
            if let Err(e) = self.state.validate() {
                error!(error = %e, "scheduler state validation failed");
            }
        }
    }

    fn send(&self, to: &Address, msg: &ToWorker) {
        self.send_op(to, msg.op(), msg);
    }

    fn send_op<T: Serialize>(&self, to: &Address, op: &str, payload: &T) {
        if let Err(e) = self.handle.send(to, op, payload) {
            // The peer is gone; its disconnect event does the cleanup.
            debug!(to = %to, op, error = %e, "dropping outbound message");
        }
    }

    fn reply(&self, request: &Message, reply: &SchedulerReply) {
        if let Err(e) = self.handle.reply(request, reply) {
            debug!(to = %request.sender, error = %e, "dropping reply");
        }
    }
}

/// Current time on the tokio clock, so paused-time tests see heartbeats age.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
