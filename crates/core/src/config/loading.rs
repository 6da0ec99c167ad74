use std::path::Path;

use crate::error::HiveError;

use super::helpers::override_from_env;
use super::types::HiveConfig;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

impl HiveConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, HiveError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, HiveError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Every field maps to `HIVE_<SECTION>_<FIELD>`, e.g.
    /// `HIVE_SCHEDULER_HEARTBEAT_INTERVAL_MS` or `HIVE_WORKER_NTHREADS`.
    /// Worker resources are not overridable from the environment.
    pub(crate) fn apply_env_overrides(&mut self) {
        let s = &mut self.scheduler;
        override_from_env("HIVE_SCHEDULER_HEARTBEAT_INTERVAL_MS", &mut s.heartbeat_interval_ms);
        override_from_env("HIVE_SCHEDULER_WORKER_TTL_INTERVALS", &mut s.worker_ttl_intervals);
        override_from_env("HIVE_SCHEDULER_ALLOWED_FAILURES", &mut s.allowed_failures);
        override_from_env("HIVE_SCHEDULER_UNKNOWN_TASK_DURATION_MS", &mut s.unknown_task_duration_ms);
        override_from_env("HIVE_SCHEDULER_RESTART_TIMEOUT_MS", &mut s.restart_timeout_ms);
        override_from_env("HIVE_SCHEDULER_VALIDATE", &mut s.validate);

        let w = &mut self.worker;
        override_from_env("HIVE_WORKER_NTHREADS", &mut w.nthreads);
        override_from_env("HIVE_WORKER_LONG_RUNNING_THREADS", &mut w.long_running_threads);
        override_from_env("HIVE_WORKER_TRANSFER_LIMIT", &mut w.transfer_limit);
        override_from_env("HIVE_WORKER_TRANSFER_BATCH_KEYS", &mut w.transfer_batch_keys);
        override_from_env("HIVE_WORKER_CONNECT_ATTEMPTS", &mut w.connect_attempts);
        override_from_env("HIVE_WORKER_CONNECT_TIMEOUT_MS", &mut w.connect_timeout_ms);
        override_from_env("HIVE_WORKER_MISSING_RETRY_MS", &mut w.missing_retry_ms);

        let c = &mut self.client;
        override_from_env("HIVE_CLIENT_GATHER_ATTEMPTS", &mut c.gather_attempts);
        override_from_env("HIVE_CLIENT_REQUEST_TIMEOUT_MS", &mut c.request_timeout_ms);
        override_from_env("HIVE_CLIENT_RESTART_TIMEOUT_MS", &mut c.restart_timeout_ms);

        override_from_env("HIVE_COMM_OFFLOAD_THRESHOLD_BYTES", &mut self.comm.offload_threshold_bytes);
    }
}
