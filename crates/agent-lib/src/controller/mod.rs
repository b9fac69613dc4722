//! Controller-facing HTTP plumbing.
//!
//! [`ControllerClient`] wraps the handful of verbs the protocol needs
//! (long-poll for commands, post events/results/logs/stats) around a
//! per-controller identity. [`Sinks`] is the tag-keyed routing table that
//! takes a job result back to the controller that issued the originating
//! command.

mod poller;

pub use poller::{start_pollers, Poller, PollerConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AgentError, Result};
use crate::models::{JobResult, Message};
use crate::pm::ProcessManager;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery endpoint for job results, selected by routing tag.
#[async_trait]
pub trait Sink: Send + Sync {
    /// The stable routing label; inbound results match on it.
    fn key(&self) -> &str;

    /// Delivers one job result to the controller behind this sink.
    async fn respond(&self, result: &JobResult) -> Result<()>;
}

/// HTTP client bound to one controller: key, base url and the agent's
/// gid/nid identity.
pub struct ControllerClient {
    key: String,
    base: Url,
    gid: u32,
    nid: u32,
    http: reqwest::Client,
}

impl ControllerClient {
    /// Builds a client for `base_url`. The underlying HTTP client carries
    /// no overall timeout so the command poll can long-poll; every other
    /// request sets its own.
    pub fn new(key: impl Into<String>, base_url: &str, gid: u32, nid: u32) -> Result<Self> {
        let key = key.into();
        let base = Url::parse(base_url)
            .map_err(|e| AgentError::validation(format!("controller '{key}' url invalid: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(AgentError::validation(format!(
                "controller '{key}' url '{base_url}' cannot carry a path"
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            key,
            base,
            gid,
            nid,
            http,
        })
    }

    /// The `{base}/{gid}/{nid}/{kind}` endpoint for
    /// `kind in {cmd, event, log, stats, result}`.
    pub fn build_url(&self, kind: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                self.gid.to_string(),
                self.nid.to_string(),
                kind.to_string(),
            ]);
        }
        url
    }

    /// Long-polls the command endpoint. Returns the raw status and body;
    /// the poller owns the interpretation.
    pub(crate) async fn poll_raw(&self, roles: &[String]) -> reqwest::Result<(StatusCode, Vec<u8>)> {
        let mut url = self.build_url("cmd");
        for role in roles {
            url.query_pairs_mut().append_pair("role", role);
        }
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok((status, body))
    }

    /// Posts a named event, e.g. `startup`.
    pub async fn send_event(&self, name: &str) -> Result<()> {
        self.http
            .post(self.build_url("event"))
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Posts one job result.
    pub async fn send_result(&self, result: &JobResult) -> Result<()> {
        self.http
            .post(self.build_url("result"))
            .timeout(REQUEST_TIMEOUT)
            .json(result)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Posts a message batch to the controller log endpoint.
    pub async fn send_logs(&self, batch: &[Message]) -> Result<()> {
        self.http
            .post(self.build_url("log"))
            .timeout(REQUEST_TIMEOUT)
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Posts a stats snapshot.
    pub async fn send_stats<T: Serialize + Sync>(&self, snapshot: &T) -> Result<()> {
        self.http
            .post(self.build_url("stats"))
            .timeout(REQUEST_TIMEOUT)
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Sink for ControllerClient {
    fn key(&self) -> &str {
        &self.key
    }

    async fn respond(&self, result: &JobResult) -> Result<()> {
        self.send_result(result).await
    }
}

/// Tag-keyed routing table. Built once at boot; steady state is read-only.
#[derive(Default)]
pub struct Sinks {
    inner: HashMap<String, Arc<dyn Sink>>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink under its own key.
    pub fn insert(&mut self, sink: Arc<dyn Sink>) {
        self.inner.insert(sink.key().to_string(), sink);
    }

    /// The sink registered under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Sink>> {
        self.inner.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Routes every terminal job result to the sink matching its tag. Results
/// with an unknown or empty tag are logged and dropped.
pub fn spawn_result_router(pm: &ProcessManager, sinks: Arc<Sinks>) -> JoinHandle<()> {
    let mut results = pm.subscribe_results();
    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            match sinks.get(&result.tags) {
                Some(sink) => {
                    debug!(id = %result.id, tags = %result.tags, "delivering result");
                    if let Err(e) = sink.respond(&result).await {
                        warn!(id = %result.id, tags = %result.tags, error = %e,
                              "result delivery failed");
                    }
                }
                None => {
                    debug!(id = %result.id, tags = %result.tags,
                           "result without a matching sink, dropping");
                }
            }
        }
    })
}
