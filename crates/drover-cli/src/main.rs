//! The `drover` binary.
//!
//! Runs a standalone orchestration node: coordinator (with the HTTP
//! API and cron scheduler) plus an embedded worker over the in-memory
//! broker, persisting to SQLite or to memory. Clustered deployments
//! swap the broker/datastore behind the same traits and run the
//! coordinator and workers as separate processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use drover_broker::{Broker, InMemoryBroker};
use drover_coordinator::{Config, Coordinator};
use drover_datastore::{Datastore, InMemoryDatastore, InMemoryLocker, SqliteDatastore};
use drover_runtime::ShellRuntime;
use drover_worker::{Worker, WorkerConfig, WorkerLimits};

#[derive(Parser)]
#[command(name = "drover", version, about = "distributed job orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an orchestration node.
    Run {
        #[command(subcommand)]
        mode: Mode,
    },
}

#[derive(Subcommand)]
enum Mode {
    /// Coordinator, API, scheduler, and an embedded worker in one
    /// process.
    Standalone(StandaloneArgs),
}

#[derive(Args)]
struct StandaloneArgs {
    /// HTTP API bind address.
    #[arg(long, default_value = "0.0.0.0:8000", env = "DROVER_ADDRESS")]
    address: String,

    /// SQLite database path. Omit for a purely in-memory node.
    #[arg(long, env = "DROVER_DB")]
    db: Option<PathBuf>,

    /// Work queue subscriptions as `name=concurrency`. Repeatable.
    #[arg(long = "queue", value_parser = parse_queue)]
    queues: Vec<(String, usize)>,

    /// Default CPU limit applied to tasks that declare none.
    #[arg(long, env = "DROVER_DEFAULT_CPUS")]
    default_cpus: Option<String>,

    /// Default memory limit applied to tasks that declare none.
    #[arg(long, env = "DROVER_DEFAULT_MEMORY")]
    default_memory: Option<String>,

    /// Scratch directory for task workspaces.
    #[arg(long, env = "DROVER_TEMPDIR")]
    tempdir: Option<PathBuf>,
}

fn parse_queue(value: &str) -> Result<(String, usize), String> {
    let (name, concurrency) = value
        .split_once('=')
        .ok_or_else(|| format!("`{value}` is not of the form name=concurrency"))?;
    let concurrency: usize = concurrency
        .parse()
        .map_err(|_| format!("`{concurrency}` is not a number"))?;
    if !drover_core::queue::is_worker_queue(name) {
        return Err(format!("`{name}` is a reserved coordinator queue"));
    }
    Ok((name.to_string(), concurrency))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            mode: Mode::Standalone(args),
        } => run_standalone(args).await,
    }
}

async fn run_standalone(args: StandaloneArgs) -> anyhow::Result<()> {
    let broker = InMemoryBroker::new();
    let datastore: Arc<dyn Datastore> = match &args.db {
        Some(path) => {
            info!(path = %path.display(), "using sqlite datastore");
            Arc::new(SqliteDatastore::open(path).context("opening sqlite datastore")?)
        }
        None => {
            info!("using in-memory datastore");
            Arc::new(InMemoryDatastore::new())
        }
    };

    let mut config = Config::new(
        Arc::new(broker.clone()),
        Arc::clone(&datastore),
        Arc::new(InMemoryLocker::new()),
    );
    config.address = Some(args.address.clone());

    let coordinator = Coordinator::new(config)?;
    coordinator.start().await.context("starting coordinator")?;

    let mut queues: HashMap<String, usize> = args.queues.into_iter().collect();
    if queues.is_empty() {
        queues.insert(drover_core::queue::QUEUE_DEFAULT.to_string(), 2);
    }
    let worker = Worker::new(WorkerConfig {
        broker: Arc::new(broker.clone()),
        runtime: Arc::new(ShellRuntime::new()),
        queues,
        limits: WorkerLimits {
            default_cpus: args.default_cpus.unwrap_or_default(),
            default_memory: args.default_memory.unwrap_or_default(),
        },
        tempdir: args.tempdir,
    });
    worker.start().await.context("starting worker")?;

    info!(address = %args.address, "drover is up");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    worker.stop();
    coordinator.stop();
    broker.shutdown().await.ok();
    Ok(())
}
