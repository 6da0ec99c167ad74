use super::types::HiveConfig;
use crate::error::HiveError;

impl HiveConfig {
    /// Validate the config: reject zero-sized limits and negative resources.
    pub fn validate(&self) -> Result<(), HiveError> {
        self.validate_scheduler()?;
        self.validate_worker()?;
        self.validate_client()?;
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), HiveError> {
        let s = &self.scheduler;
        if s.heartbeat_interval_ms == 0 {
            return Err(HiveError::Config(
                "scheduler.heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if s.worker_ttl_intervals == 0 {
            return Err(HiveError::Config(
                "scheduler.worker_ttl_intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn validate_worker(&self) -> Result<(), HiveError> {
        let w = &self.worker;
        for (name, value) in [
            ("nthreads", w.nthreads),
            ("transfer_limit", w.transfer_limit),
            ("transfer_batch_keys", w.transfer_batch_keys),
        ] {
            if value == 0 {
                return Err(HiveError::Config(format!(
                    "worker.{name} must be greater than zero"
                )));
            }
        }
        if w.connect_attempts == 0 {
            return Err(HiveError::Config(
                "worker.connect_attempts must be greater than zero".into(),
            ));
        }
        if let Some((name, amount)) = w.resources.iter().find(|(_, v)| v.is_nan() || **v < 0.0) {
            return Err(HiveError::Config(format!(
                "worker resource '{name}' has invalid amount {amount}"
            )));
        }
        Ok(())
    }

    fn validate_client(&self) -> Result<(), HiveError> {
        if self.client.gather_attempts == 0 {
            return Err(HiveError::Config(
                "client.gather_attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
