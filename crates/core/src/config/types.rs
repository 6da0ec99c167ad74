use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a hive cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HiveConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub comm: CommConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Scheduler section: liveness, failure tolerance and restart bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval at which workers send heartbeats and the scheduler checks them.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat intervals of silence after which a worker is removed.
    #[serde(default = "default_worker_ttl_intervals")]
    pub worker_ttl_intervals: u32,

    /// Worker deaths a task may be involved in before it errs with `KilledWorker`.
    #[serde(default = "default_allowed_failures")]
    pub allowed_failures: u32,

    /// Duration estimate for task prefixes never seen before.
    #[serde(default = "default_unknown_task_duration_ms")]
    pub unknown_task_duration_ms: u64,

    /// Upper bound on how long a restart waits for workers to rejoin.
    #[serde(default = "default_restart_timeout_ms")]
    pub restart_timeout_ms: u64,

    /// Run a full consistency check of scheduler state after every event.
    #[serde(default)]
    pub validate: bool,
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_worker_ttl_intervals() -> u32 {
    10
}

fn default_allowed_failures() -> u32 {
    3
}

fn default_unknown_task_duration_ms() -> u64 {
    500
}

fn default_restart_timeout_ms() -> u64 {
    20_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            worker_ttl_intervals: default_worker_ttl_intervals(),
            allowed_failures: default_allowed_failures(),
            unknown_task_duration_ms: default_unknown_task_duration_ms(),
            restart_timeout_ms: default_restart_timeout_ms(),
            validate: false,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a worker is declared dead.
    pub fn worker_ttl(&self) -> Duration {
        self.heartbeat_interval() * self.worker_ttl_intervals
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }
}

/// Worker section: execution slots and peer transfer limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrently executing tasks.
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,

    /// Extra pool threads available to tasks that seceded.
    #[serde(default = "default_long_running_threads")]
    pub long_running_threads: usize,

    /// Concurrent gathers from peers.
    #[serde(default = "default_transfer_limit")]
    pub transfer_limit: usize,

    /// Keys batched into one gather from the same peer.
    #[serde(default = "default_transfer_batch_keys")]
    pub transfer_batch_keys: usize,

    /// Attempts per gather before the peer is reported as failed.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Timeout of a single gather attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval at which holders of missing keys are asked for again.
    #[serde(default = "default_missing_retry_ms")]
    pub missing_retry_ms: u64,

    /// Abstract resources this worker offers, e.g. `{ GPU = 1 }`.
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

fn default_nthreads() -> usize {
    2
}

fn default_long_running_threads() -> usize {
    4
}

fn default_transfer_limit() -> usize {
    4
}

fn default_transfer_batch_keys() -> usize {
    16
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_missing_retry_ms() -> u64 {
    1_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nthreads: default_nthreads(),
            long_running_threads: default_long_running_threads(),
            transfer_limit: default_transfer_limit(),
            transfer_batch_keys: default_transfer_batch_keys(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            missing_retry_ms: default_missing_retry_ms(),
            resources: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn missing_retry(&self) -> Duration {
        Duration::from_millis(self.missing_retry_ms)
    }
}

/// Client section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Attempts to fetch a finished result before giving up.
    #[serde(default = "default_gather_attempts")]
    pub gather_attempts: u32,

    /// Timeout for request/reply exchanges with the scheduler.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long `restart` waits for the workers to come back.
    #[serde(default = "default_client_restart_timeout_ms")]
    pub restart_timeout_ms: u64,
}

fn default_gather_attempts() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_client_restart_timeout_ms() -> u64 {
    20_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gather_attempts: default_gather_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
            restart_timeout_ms: default_client_restart_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }
}

/// Messaging section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommConfig {
    /// Payloads estimated above this size are encoded on the blocking pool.
    #[serde(default = "default_offload_threshold_bytes")]
    pub offload_threshold_bytes: usize,
}

fn default_offload_threshold_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            offload_threshold_bytes: default_offload_threshold_bytes(),
        }
    }
}
