//! hive-local: run a small computation on an in-process cluster.
//!
//! Starts a scheduler and a few workers, maps `inc` over a range, sums the
//! results on the cluster and logs the total.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hive_client::{ClientError, LocalCluster, SubmitOptions};
use hive_core::config::load_dotenv;
use hive_core::{Arg, Function, FunctionRegistry, HiveConfig, TaskCall, TaskError};
use serde_json::Value;
use tracing::{info, warn};

// ── CLI ─────────────────────────────────────────────────────────────

/// Smoke-test a local hive cluster.
#[derive(Parser, Debug)]
#[command(name = "hive-local", version, about)]
struct Cli {
    /// Path to a hive.toml config file. Defaults plus environment overrides when absent.
    #[arg(long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of workers to start.
    #[arg(long, env = "HIVE_LOCAL_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Number of increments to map.
    #[arg(long, default_value_t = 100)]
    tasks: i64,

    /// Seconds to wait for the total.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn functions() -> (Function, Function) {
    let inc = Function::new("inc", |call: &TaskCall| Ok(Value::from(call.arg_i64(0)? + 1)));
    let total = Function::new("sum", |call: &TaskCall| {
        let items = call
            .arg(0)?
            .as_array()
            .ok_or_else(|| TaskError::argument("expected a list"))?;
        Ok(Value::from(items.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    (inc, total)
}

async fn run(cluster: &LocalCluster, cli: &Cli) -> Result<Value, ClientError> {
    let (inc, total) = functions();
    let client = cluster.client().await?;
    client.wait_for_workers(cli.workers, Some(Duration::from_secs(cli.timeout))).await?;

    let inputs: Vec<Arg> = (0..cli.tasks).map(Arg::from).collect();
    let futures = client.map(&inc, vec![inputs], &SubmitOptions::default())?;
    let sum = client.submit(&total, vec![Arg::keys(futures.iter().map(|f| f.key()))])?;
    let value = sum.result(Some(Duration::from_secs(cli.timeout))).await;
    client.close().await;
    value
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = HiveConfig::from_file(path)?;
            info!(path = %path.display(), "loaded hive config");
            config
        }
        None => HiveConfig::from_env()?,
    };

    let registry = FunctionRegistry::new();
    let cluster = LocalCluster::start(&registry, cli.workers, config)?;
    let outcome = run(&cluster, &cli).await;
    cluster.close().await;

    let total = outcome?;
    let expected: i64 = (1..=cli.tasks).sum();
    if total == Value::from(expected) {
        info!(tasks = cli.tasks, total = %total, "computation finished");
    } else {
        warn!(tasks = cli.tasks, total = %total, expected, "unexpected total");
    }
    Ok(())
}
