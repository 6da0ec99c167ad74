//! Cluster configuration.
//!
//! Loaded from `hive.toml` (every field has a default), then overridden from
//! `HIVE_<SECTION>_<KEY>` environment variables, then validated.

mod helpers;
mod loading;
mod types;
mod validation;


pub use loading::load_dotenv;
pub use types::{ClientConfig, CommConfig, HiveConfig, SchedulerConfig, WorkerConfig};
