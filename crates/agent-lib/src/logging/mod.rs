//! Log consumers for the message fan-out.
//!
//! Loggers sit behind a pump task that drains the process manager's
//! message broadcast. The console logger writes through `tracing`; the
//! batching logger buffers messages and posts them to every controller's
//! log endpoint on a full buffer or a periodic tick. Both honor the
//! configured default level set, overridable per command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{ControllerClient, Sink};
use crate::models::{levels, Message};
use crate::pm::ProcessManager;

/// Consumer of the interim message stream.
#[async_trait]
pub trait Logger: Send + Sync {
    async fn log(&self, msg: &Message);
}

fn level_accepted(defaults: &[i64], overrides: &[i64], level: i64) -> bool {
    let effective = if overrides.is_empty() {
        defaults
    } else {
        overrides
    };
    effective.is_empty() || effective.contains(&level)
}

/// Writes messages to the agent's own log output. Per-command `loglevels`
/// overrides the default filter.
pub struct ConsoleLogger {
    defaults: Vec<i64>,
}

impl ConsoleLogger {
    pub fn new(defaults: Vec<i64>) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Logger for ConsoleLogger {
    async fn log(&self, msg: &Message) {
        if !level_accepted(&self.defaults, &msg.args.loglevels, msg.level) {
            return;
        }
        match msg.level {
            levels::STDERR => {
                warn!(id = %msg.id, level = msg.level, "{}", msg.message)
            }
            levels::METRIC => {
                debug!(level = msg.level, "{}", msg.message)
            }
            _ => info!(id = %msg.id, level = msg.level, "{}", msg.message),
        }
    }
}

/// Settings for the batching controller logger.
#[derive(Debug, Clone)]
pub struct BatchLoggerConfig {
    /// Messages per POST; a full buffer flushes immediately.
    pub batch_size: usize,
    /// Periodic flush interval for partial batches.
    pub flush_interval: Duration,
    /// Default level filter; per-command `loglevels_ac` overrides it.
    pub defaults: Vec<i64>,
    /// Internal queue depth; enqueue drops when it is exceeded.
    pub queue_capacity: usize,
}

impl Default for BatchLoggerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(10),
            defaults: Vec::new(),
            queue_capacity: 1000,
        }
    }
}

/// Buffers messages and posts them in batches to every controller's log
/// endpoint. Enqueue never blocks the pump: overflow drops the message.
pub struct BatchLogger {
    tx: mpsc::Sender<Message>,
    defaults: Vec<i64>,
}

impl BatchLogger {
    /// Builds the logger and spawns its flush worker.
    pub fn spawn(
        clients: Vec<Arc<ControllerClient>>,
        cfg: BatchLoggerConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let defaults = cfg.defaults.clone();
        let handle = tokio::spawn(flush_worker(rx, clients, cfg, shutdown));
        (Self { tx, defaults }, handle)
    }
}

#[async_trait]
impl Logger for BatchLogger {
    async fn log(&self, msg: &Message) {
        if !level_accepted(&self.defaults, &msg.args.loglevels_ac, msg.level) {
            return;
        }
        if self.tx.try_send(msg.clone()).is_err() {
            debug!(id = %msg.id, "batch logger queue full, dropping message");
        }
    }
}

async fn flush_worker(
    mut rx: mpsc::Receiver<Message>,
    clients: Vec<Arc<ControllerClient>>,
    cfg: BatchLoggerConfig,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<Message> = Vec::with_capacity(cfg.batch_size);
    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                flush(&mut buffer, &clients).await;
                return;
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        buffer.push(msg);
                        if buffer.len() >= cfg.batch_size {
                            flush(&mut buffer, &clients).await;
                        }
                    }
                    None => {
                        flush(&mut buffer, &clients).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => flush(&mut buffer, &clients).await,
        }
    }
}

async fn flush(buffer: &mut Vec<Message>, clients: &[Arc<ControllerClient>]) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    for client in clients {
        if let Err(e) = client.send_logs(&batch).await {
            warn!(controller = %client.key(), error = %e, "log batch delivery failed");
        }
    }
}

/// Fans the message broadcast into the configured loggers. A lagging pump
/// loses the oldest messages, never results.
pub fn spawn_message_pump(
    pm: &ProcessManager,
    loggers: Vec<Arc<dyn Logger>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut messages = pm.subscribe_messages();
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = messages.recv() => received,
            };
            match received {
                Ok(msg) => {
                    for logger in &loggers {
                        logger.log(&msg).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "message pump lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Posts every runner stats snapshot to every controller's stats endpoint.
pub fn spawn_stats_pump(
    pm: &ProcessManager,
    clients: Vec<Arc<ControllerClient>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut snapshots = pm.subscribe_stats();
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = snapshots.recv() => received,
            };
            match received {
                Ok(snapshot) => {
                    for client in &clients {
                        if let Err(e) = client.send_stats(&snapshot).await {
                            warn!(controller = %client.key(), error = %e,
                                  "stats delivery failed");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    debug!(dropped, "stats pump lagged, oldest snapshots dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
