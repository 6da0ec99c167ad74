//! A scheduler and a set of supervised workers in one process.
//!
//! Each worker runs under a small supervisor task. A worker the scheduler
//! terminates (restart, missed heartbeats) is replaced under a fresh
//! address; a killed or closed worker is not.

use std::sync::{Arc, Mutex};

use hive_comm::Network;
use hive_core::{Address, FunctionRegistry, HiveConfig};
use hive_scheduler::{SchedulerHandle, SchedulerServer};
use hive_worker::{WorkerBuilder, WorkerError, WorkerExit, WorkerHandle};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::Client;
use crate::error::ClientError;
use crate::future::lock;

struct Supervisor {
    current: Arc<Mutex<Option<Address>>>,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

pub struct LocalCluster {
    network: Network,
    registry: FunctionRegistry,
    config: HiveConfig,
    scheduler: SchedulerHandle,
    supervisors: Vec<Supervisor>,
}

impl LocalCluster {
    /// Start a scheduler and `n_workers` workers sharing `registry`.
    pub fn start(registry: &FunctionRegistry, n_workers: usize, config: HiveConfig) -> Result<Self, ClientError> {
        let network = Network::new(&config.comm);
        let scheduler = SchedulerServer::start(&network, config.scheduler.clone())?;
        let mut cluster = Self {
            network,
            registry: registry.clone(),
            config,
            scheduler,
            supervisors: Vec::new(),
        };
        for _ in 0..n_workers {
            cluster.add_worker()?;
        }
        info!(workers = n_workers, "local cluster started");
        Ok(cluster)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn scheduler_address(&self) -> &Address {
        self.scheduler.address()
    }

    /// Start one more supervised worker and return its address.
    pub fn add_worker(&mut self) -> Result<Address, ClientError> {
        let spawn = {
            let network = self.network.clone();
            let registry = self.registry.clone();
            let scheduler = self.scheduler.address().clone();
            let config = self.config.worker.clone();
            let heartbeat = self.config.scheduler.heartbeat_interval();
            move || {
                WorkerBuilder::new(&network, &registry)
                    .scheduler(scheduler.clone())
                    .config(config.clone())
                    .heartbeat_interval(heartbeat)
                    .start()
            }
        };
        let worker = spawn()?;
        let address = worker.address().clone();
        let current = Arc::new(Mutex::new(Some(address.clone())));
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(supervise(worker, spawn, current.clone(), shutdown.clone()));
        self.supervisors.push(Supervisor {
            current,
            shutdown,
            join,
        });
        Ok(address)
    }

    /// Addresses of the workers currently running.
    pub fn workers(&self) -> Vec<Address> {
        self.supervisors
            .iter()
            .filter_map(|s| lock(&s.current).clone())
            .collect()
    }

    /// Crash `address` without a goodbye. It is not replaced.
    pub fn kill_worker(&self, address: &Address) -> bool {
        warn!(worker = %address, "killing worker");
        self.network.kill(address)
    }

    /// Connect a client using the cluster's client settings.
    pub async fn client(&self) -> Result<Client, ClientError> {
        Client::builder(&self.network, &self.registry)
            .scheduler(self.scheduler.address().clone())
            .config(self.config.client.clone())
            .connect()
            .await
    }

    /// Close every worker, then the scheduler.
    pub async fn close(self) {
        for supervisor in &self.supervisors {
            supervisor.shutdown.notify_one();
        }
        for supervisor in self.supervisors {
            if let Err(e) = supervisor.join.await {
                warn!(error = %e, "worker supervisor ended abnormally");
            }
        }
        self.scheduler.close().await;
        info!("local cluster closed");
    }
}

async fn supervise<F>(
    mut worker: WorkerHandle,
    spawn: F,
    current: Arc<Mutex<Option<Address>>>,
    shutdown: Arc<Notify>,
) where
    F: Fn() -> Result<WorkerHandle, WorkerError>,
{
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                worker.close().await;
                break;
            }
            exit = worker.closed() => {
                let WorkerExit::Terminated(reason) = exit else {
                    break;
                };
                match spawn() {
                    Ok(next) => {
                        info!(old = %worker.address(), new = %next.address(), reason = %reason, "replacing terminated worker");
                        *lock(&current) = Some(next.address().clone());
                        worker = next;
                    }
                    Err(e) => {
                        warn!(worker = %worker.address(), error = %e, "could not replace terminated worker");
                        break;
                    }
                }
            }
        }
    }
    *lock(&current) = None;
}
