//! Node agent - executes controller-issued commands on this host.
//!
//! The binary wires the runtime together: controller clients and sinks,
//! the process manager with its factory registry, log and stats delivery,
//! the container bridge, and one long-poll loop per controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent_lib::builtin::register_builtins;
use agent_lib::containers::{spawn_forwarder, ContainerConfig, ContainerManager, QueueStore};
use agent_lib::controller::{
    spawn_result_router, start_pollers, ControllerClient, PollerConfig, Sinks,
};
use agent_lib::logging::{
    spawn_message_pump, spawn_stats_pump, BatchLogger, BatchLoggerConfig, ConsoleLogger, Logger,
};
use agent_lib::pm::{FactoryRegistry, PmConfig, ProcessManager};

mod config;

#[derive(Parser, Debug)]
#[command(name = "agent", about = "Node agent runtime", version)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "agent.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!(config = %cli.config.display(), "Starting agent");

    let config = config::AgentConfig::load(&cli.config)?;

    // One HTTP client per controller; the same handles serve as result
    // sinks, keyed by controller key.
    let mut clients: HashMap<String, Arc<ControllerClient>> = HashMap::new();
    let mut sinks = Sinks::new();
    for (key, controller) in &config.controllers {
        let client = Arc::new(
            ControllerClient::new(key.clone(), &controller.url, config.gid, config.nid)
                .with_context(|| format!("building controller client '{key}'"))?,
        );
        sinks.insert(client.clone());
        clients.insert(key.clone(), client);
    }
    let sinks = Arc::new(sinks);

    // Factory registry: builtins plus the container command set.
    let store = Arc::new(QueueStore::new());
    let containers = ContainerManager::new(
        store.clone(),
        ContainerConfig {
            binary: config.containers.binary.clone(),
            ..Default::default()
        },
    );
    let mut registry = FactoryRegistry::new();
    register_builtins(&mut registry);
    containers.register(&mut registry);

    let pm = ProcessManager::new(
        PmConfig {
            max_jobs: config.max_jobs,
            queue_idle_grace: Duration::from_secs(config.queue_idle_grace_secs),
            ..Default::default()
        },
        registry,
    );

    let shutdown = CancellationToken::new();
    let client_list: Vec<Arc<ControllerClient>> = clients.values().cloned().collect();

    spawn_result_router(&pm, sinks.clone());

    let (batch_logger, _batch_worker) = BatchLogger::spawn(
        client_list.clone(),
        BatchLoggerConfig {
            batch_size: config.logging.batch_size,
            flush_interval: Duration::from_secs(config.logging.batch_flush_secs),
            defaults: config.logging.batch_levels.clone(),
            ..Default::default()
        },
        shutdown.clone(),
    );
    let loggers: Vec<Arc<dyn Logger>> = vec![
        Arc::new(ConsoleLogger::new(config.logging.console_levels.clone())),
        Arc::new(batch_logger),
    ];
    spawn_message_pump(&pm, loggers, shutdown.clone());
    spawn_stats_pump(&pm, client_list, shutdown.clone());
    spawn_forwarder(store, sinks, shutdown.clone());
    spawn_metrics_flusher(
        &pm,
        Duration::from_secs(config.metrics_flush_secs.max(1)),
        shutdown.clone(),
    );

    let poller_cfg = PollerConfig {
        gid: config.gid,
        nid: config.nid,
        roles: config.roles.clone(),
        default_stats_interval: config.stats_interval_secs,
        reconnect_sleep: Duration::from_secs(config.reconnect_sleep_secs),
    };
    start_pollers(&pm, &clients, &config.channels, &poller_cfg, &shutdown)
        .context("starting pollers")?;

    info!(
        gid = config.gid,
        nid = config.nid,
        controllers = clients.len(),
        "agent running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    shutdown.cancel();
    pm.shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;

    Ok(())
}

/// Drives the aggregator flush so pending averages surface as metric
/// messages on a fixed cadence.
fn spawn_metrics_flusher(pm: &ProcessManager, every: Duration, shutdown: CancellationToken) {
    let pm = pm.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => pm.flush_metrics(),
            }
        }
    });
}
