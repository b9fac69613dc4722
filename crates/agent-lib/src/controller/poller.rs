//! Long-poll loop pulling commands from one controller.
//!
//! Each poller owns the startup-event protocol: the event is sent before
//! the first poll and again after any failure that looks like a lost
//! connection, so a controller that restarts always observes a fresh
//! startup. Transport failures back off by `reconnect_sleep` when they
//! repeat within that window; protocol failures drop the command and rely
//! on the controller to re-issue it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ControllerClient;
use crate::error::{AgentError, Result};
use crate::models::Command;
use crate::pm::ProcessManager;

/// Settings shared by every poller of one agent.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Agent identity stamped onto every inbound command.
    pub gid: u32,
    pub nid: u32,
    /// Roles advertised on the command poll.
    pub roles: Vec<String>,
    /// Fallback for commands that arrive without a stats interval, seconds.
    pub default_stats_interval: u64,
    /// Minimum spacing between reconnect attempts after repeated failures.
    pub reconnect_sleep: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            gid: 0,
            nid: 0,
            roles: Vec::new(),
            default_stats_interval: 60,
            reconnect_sleep: Duration::from_secs(4),
        }
    }
}

/// One long-poll loop bound to a controller key.
pub struct Poller {
    key: String,
    pm: ProcessManager,
    client: Arc<ControllerClient>,
    cfg: PollerConfig,
}

impl Poller {
    pub fn new(
        key: impl Into<String>,
        pm: ProcessManager,
        client: Arc<ControllerClient>,
        cfg: PollerConfig,
    ) -> Self {
        Self {
            key: key.into(),
            pm,
            client,
            cfg,
        }
    }

    /// Runs until `shutdown` fires. Never returns on its own.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(controller = %self.key, "poller started");
        let mut send_startup = true;
        let mut last_fail: Option<Instant> = None;
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            if send_startup {
                match self.client.send_event("startup").await {
                    Ok(()) => {
                        debug!(controller = %self.key, "startup event sent");
                        send_startup = false;
                    }
                    Err(e) => {
                        warn!(controller = %self.key, error = %e, "startup event failed");
                    }
                }
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => return,
                res = self.client.poll_raw(&self.cfg.roles) => res,
            };

            match polled {
                Err(err) => {
                    warn!(controller = %self.key, error = %err, "no new commands, retrying");
                    if connection_lost(&err) || consecutive_failures >= 1 {
                        send_startup = true;
                    }
                    consecutive_failures += 1;
                    if last_fail.is_some_and(|t| t.elapsed() < self.cfg.reconnect_sleep) {
                        pause(&shutdown, self.cfg.reconnect_sleep).await;
                    }
                    last_fail = Some(Instant::now());
                }
                Ok((status, body)) => {
                    consecutive_failures = 0;
                    if status != StatusCode::OK {
                        warn!(controller = %self.key, status = %status,
                              "unexpected poll response");
                        pause(&shutdown, Duration::from_secs(2)).await;
                        continue;
                    }
                    if body.is_empty() {
                        // Long-poll timeout on the controller side.
                        continue;
                    }
                    let mut cmd = match Command::from_slice(&body) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            warn!(controller = %self.key, error = %e,
                                  "discarding undecodable command");
                            continue;
                        }
                    };
                    self.decorate(&mut cmd);
                    info!(controller = %self.key, id = %cmd.id, name = %cmd.name,
                          "command received");
                    if cmd.args.queue.is_empty() {
                        self.pm.run(cmd);
                    } else {
                        self.pm.run_queued(cmd);
                    }
                }
            }
        }
    }

    /// Stamps defaults, routing tag and agent identity onto an inbound
    /// command, in that order.
    fn decorate(&self, cmd: &mut Command) {
        if cmd.args.stats_interval == 0 {
            cmd.args.stats_interval = self.cfg.default_stats_interval;
        }
        cmd.args.set_tag(&self.key);
        cmd.route = self.key.clone();
        cmd.gid = self.cfg.gid;
        cmd.nid = self.cfg.nid;
    }
}

/// Whether a transport error means the controller connection is gone, in
/// which case the startup event must be re-sent once it returns.
fn connection_lost(err: &reqwest::Error) -> bool {
    if err.is_connect() {
        return true;
    }
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cause {
        let text = e.to_string().to_lowercase();
        if text.contains("connection refused") || text.contains("eof") {
            return true;
        }
        cause = e.source();
    }
    false
}

async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Spawns one poller per controller key. A non-empty `channels` list
/// restricts polling to that subset; naming an unknown controller is a
/// bootstrap error.
pub fn start_pollers(
    pm: &ProcessManager,
    clients: &HashMap<String, Arc<ControllerClient>>,
    channels: &[String],
    cfg: &PollerConfig,
    shutdown: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let keys: Vec<String> = if channels.is_empty() {
        clients.keys().cloned().collect()
    } else {
        channels.to_vec()
    };

    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        let client = clients
            .get(&key)
            .ok_or_else(|| AgentError::validation(format!("no controller named '{key}'")))?
            .clone();
        let poller = Poller::new(key, pm.clone(), client, cfg.clone());
        handles.push(tokio::spawn(poller.run(shutdown.clone())));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::{FactoryRegistry, PmConfig};

    fn test_poller(key: &str) -> Poller {
        let pm = ProcessManager::new(PmConfig::default(), FactoryRegistry::new());
        let client = Arc::new(ControllerClient::new(key, "http://127.0.0.1:1", 7, 8).unwrap());
        Poller::new(
            key,
            pm,
            client,
            PollerConfig {
                gid: 7,
                nid: 8,
                default_stats_interval: 300,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn decoration_tags_routes_and_rewrites_identity() {
        let poller = test_poller("main");
        let mut cmd = Command {
            id: "c1".into(),
            gid: 99,
            nid: 99,
            name: "ping".into(),
            ..Default::default()
        };

        poller.decorate(&mut cmd);
        assert_eq!(cmd.args.tags, "main");
        assert_eq!(cmd.route, "main");
        assert_eq!(cmd.gid, 7);
        assert_eq!(cmd.nid, 8);
        assert_eq!(cmd.args.stats_interval, 300);
    }

    #[tokio::test]
    async fn decoration_keeps_explicit_stats_interval() {
        let poller = test_poller("main");
        let mut cmd = Command {
            id: "c2".into(),
            name: "ping".into(),
            ..Default::default()
        };
        cmd.args.stats_interval = 5;

        poller.decorate(&mut cmd);
        assert_eq!(cmd.args.stats_interval, 5);
    }

    #[tokio::test]
    async fn unknown_channel_key_is_a_bootstrap_error() {
        let pm = ProcessManager::new(PmConfig::default(), FactoryRegistry::new());
        let clients = HashMap::new();
        let shutdown = CancellationToken::new();
        let err = start_pollers(
            &pm,
            &clients,
            &["missing".to_string()],
            &PollerConfig::default(),
            &shutdown,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
