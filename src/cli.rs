//! Command-line entry points for the engine and the notification bridge.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::providers::{Env, Serialized};
use figment::Figment;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapters::{PgPersistenceGateway, RedisBroker};
use crate::domain::models::EngineConfig;
use crate::domain::ports::{NullAgentRuntime, NullCapabilityRegistry, NullToolRuntime};
use crate::logging;
use crate::services::{watch_shutdown_signals, Engine, EngineDeps, NotifyBridge, RetryPolicy};

#[derive(Parser)]
#[command(name = "synapse-engine", version, about = "Workflow orchestration engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the dispatcher worker pool (default)
    Run(RunArgs),
    /// Run the store-to-broker notification bridge
    Bridge(BridgeArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Dispatcher count for this process
    #[arg(long)]
    pub workers: Option<usize>,

    /// Broker queue name
    #[arg(long)]
    pub queue: Option<String>,

    /// Per-task deadline in seconds
    #[arg(long)]
    pub deadline: Option<u64>,
}

#[derive(Args, Default)]
pub struct BridgeArgs {
    /// Broker queue name
    #[arg(long)]
    pub queue: Option<String>,
}

/// Process failure, split by exit code: 1 for startup errors, 2 for an
/// unrecoverable loop error.
#[derive(Debug)]
pub enum ExitError {
    Startup(anyhow::Error),
    Fatal(anyhow::Error),
}

impl ExitError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Startup(_) => 1,
            Self::Fatal(_) => 2,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            Self::Startup(err) | Self::Fatal(err) => err,
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), ExitError> {
    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_engine(args).await,
        Command::Bridge(args) => run_bridge(args).await,
    }
}

async fn run_engine(args: RunArgs) -> Result<(), ExitError> {
    let config = load_config()
        .map(|mut config| {
            if let Some(workers) = args.workers {
                config.workers = workers;
            }
            if let Some(queue) = args.queue {
                config.task_queue = queue;
            }
            if let Some(deadline) = args.deadline {
                config.task_deadline_seconds = deadline;
            }
            config
        })
        .map_err(ExitError::Startup)?;
    config
        .validate()
        .map_err(|msg| ExitError::Startup(anyhow::anyhow!(msg)))?;
    logging::init(&config.log_level, &config.log_format).map_err(ExitError::Startup)?;

    let gateway = PgPersistenceGateway::connect(&config.store_dsn, config.store_pool_size)
        .await
        .context("failed to connect to the store")
        .map_err(ExitError::Startup)?;
    let broker = RedisBroker::connect(&config.broker_url())
        .await
        .context("failed to connect to the broker")
        .map_err(ExitError::Startup)?;

    let deps = EngineDeps {
        gateway: Arc::new(gateway),
        broker: Arc::new(broker),
        agents: Arc::new(NullAgentRuntime),
        tools: Arc::new(NullToolRuntime),
        capabilities: Arc::new(NullCapabilityRegistry),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_shutdown_signals(shutdown.clone()));

    Engine::new(config, deps)
        .run(shutdown)
        .await
        .map_err(ExitError::Fatal)
}

async fn run_bridge(args: BridgeArgs) -> Result<(), ExitError> {
    let mut config = load_config().map_err(ExitError::Startup)?;
    if let Some(queue) = args.queue {
        config.task_queue = queue;
    }
    config
        .validate()
        .map_err(|msg| ExitError::Startup(anyhow::anyhow!(msg)))?;
    logging::init(&config.log_level, &config.log_format).map_err(ExitError::Startup)?;

    let broker = RedisBroker::connect(&config.broker_url())
        .await
        .context("failed to connect to the broker")
        .map_err(ExitError::Startup)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_shutdown_signals(shutdown.clone()));

    let bridge = NotifyBridge::new(
        config.store_dsn.clone(),
        Arc::new(broker),
        config.task_queue.clone(),
        RetryPolicy::new(config.store_retry_max, 500, 30_000),
        Duration::from_secs(config.bridge_horizon_seconds),
        shutdown,
    );

    bridge
        .run()
        .await
        .context("notification bridge terminated")
        .map_err(ExitError::Fatal)
}

/// Merge programmatic defaults with the flat environment keys
/// (`STORE_DSN`, `BROKER_HOST`, `TASK_QUEUE`, …).
fn load_config() -> Result<EngineConfig> {
    Figment::new()
        .merge(Serialized::defaults(EngineConfig::default()))
        .merge(Env::prefixed("").only(&[
            "store_dsn",
            "broker_host",
            "broker_port",
            "task_queue",
            "workers",
            "task_deadline_seconds",
            "store_retry_max",
            "shutdown_grace_seconds",
            "bridge_horizon_seconds",
            "store_pool_size",
            "log_level",
            "log_format",
        ]))
        .extract()
        .context("failed to load configuration from environment")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from(["synapse-engine", "run", "--workers", "8", "--queue", "q2"]);
        match cli.command {
            Some(Command::Run(args)) => {
                assert_eq!(args.workers, Some(8));
                assert_eq!(args.queue.as_deref(), Some("q2"));
                assert_eq!(args.deadline, None);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["synapse-engine"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parses_bridge() {
        let cli = Cli::parse_from(["synapse-engine", "bridge", "--queue", "alt"]);
        assert!(matches!(cli.command, Some(Command::Bridge(_))));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitError::Startup(anyhow::anyhow!("x")).code(), 1);
        assert_eq!(ExitError::Fatal(anyhow::anyhow!("x")).code(), 2);
    }
}
