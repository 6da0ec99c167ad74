//! The hive client: futures for submitted tasks, group waits, an executor
//! facade and an in-process cluster harness.
//!
//! ```no_run
//! # async fn demo() -> Result<(), hive_client::ClientError> {
//! use hive_client::{Client, LocalCluster};
//! use hive_core::{Arg, Function, FunctionRegistry, HiveConfig, TaskCall};
//!
//! let registry = FunctionRegistry::new();
//! let inc = Function::new("inc", |call: &TaskCall| Ok((call.arg_i64(0)? + 1).into()));
//! let cluster = LocalCluster::start(&registry, 2, HiveConfig::default())?;
//! let client = cluster.client().await?;
//! let future = client.submit(&inc, vec![Arg::from(1)])?;
//! assert_eq!(future.result(None).await?, 2);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod error;
pub mod executor;
pub mod future;
pub mod wait;

pub use client::{Client, ClientBuilder, SubmitOptions};
pub use cluster::LocalCluster;
pub use error::ClientError;
pub use executor::{Executor, MapResults};
pub use future::{FutureStatus, TaskFuture, WeakFuture};
pub use wait::{as_completed, wait, ReturnWhen, WaitResult};
