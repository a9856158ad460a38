//! Engine orchestrator: the composition root.
//!
//! Wires the gateway, broker, and collaborator ports into a processor,
//! spawns the dispatcher pool, and owns graceful shutdown: stop accepting
//! pops, wait up to the grace period for in-flight work, then abandon it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::models::EngineConfig;
use crate::domain::ports::{
    AgentRuntime, BrokerQueue, CapabilityRegistry, PersistenceGateway, ToolRuntime,
};
use crate::services::dispatcher::Dispatcher;
use crate::services::retry::RetryPolicy;
use crate::services::task_processor::TaskProcessor;

/// Everything the engine consumes, injected by the caller. The binary wires
/// Postgres, Redis, and null collaborators; embedding deployments swap in
/// real runtime clients.
pub struct EngineDeps {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub broker: Arc<dyn BrokerQueue>,
    pub agents: Arc<dyn AgentRuntime>,
    pub tools: Arc<dyn ToolRuntime>,
    pub capabilities: Arc<dyn CapabilityRegistry>,
}

pub struct Engine {
    config: EngineConfig,
    deps: EngineDeps,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self { config, deps }
    }

    /// Run the worker pool until the shutdown token fires, then drain
    /// within the grace period.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let retry = RetryPolicy::new(self.config.store_retry_max, 500, 30_000);
        let processor = Arc::new(TaskProcessor::new(
            self.deps.gateway,
            self.deps.agents,
            self.deps.tools,
            self.deps.capabilities,
            retry,
            Duration::from_secs(self.config.task_deadline_seconds),
        ));

        info!(
            workers = self.config.workers,
            queue = %self.config.task_queue,
            "engine starting"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let dispatcher = Dispatcher::new(
                Arc::clone(&self.deps.broker),
                Arc::clone(&processor),
                self.config.task_queue.clone(),
                shutdown.clone(),
            );
            workers.spawn(async move { dispatcher.run(worker_id).await });
        }

        shutdown.cancelled().await;
        info!(
            grace_secs = self.config.shutdown_grace_seconds,
            "shutdown signalled; draining workers"
        );

        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        if timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("grace period elapsed with workers still in flight; aborting");
            workers.abort_all();
        }

        info!("engine stopped");
        Ok(())
    }
}

/// Cancel the token on SIGINT or SIGTERM. Spawned once by the binary.
pub async fn watch_shutdown_signals(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install ctrl-c handler")?;
        info!("received interrupt");
    }
    shutdown.cancel();
    Ok(())
}
