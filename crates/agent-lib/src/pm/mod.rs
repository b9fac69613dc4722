//! Process manager: the in-process scheduler.
//!
//! Accepts commands from pollers and internal callers, runs them through a
//! bounded worker pool or named serial queues, tracks live runners, fans
//! out messages/results/stats to subscribers and aggregates counters.
//!
//! Subscriber channels have different loss policies: interim messages and
//! stats snapshots ride a bounded broadcast where a lagging subscriber
//! loses the oldest entries, while job results go over per-subscriber
//! unbounded channels and are never dropped.

mod aggregator;
mod process;
mod queues;
mod runner;


pub use aggregator::{AggregateOp, Aggregator, MetricSample};
pub use process::{ExecContext, FactoryRegistry, Process, ProcessFactory};
pub use runner::{ProcessStats, Runner, RunnerState};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::models::{levels, Command, JobResult, Message, State};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct PmConfig {
    /// Worker pool size for the unnamed substrate.
    pub max_jobs: usize,
    /// How long an empty named queue lingers before teardown.
    pub queue_idle_grace: Duration,
    /// Capacity of the message and stats broadcast channels.
    pub channel_capacity: usize,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            queue_idle_grace: Duration::from_secs(60),
            channel_capacity: 1024,
        }
    }
}

/// Periodic usage snapshot of one live runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    /// Command id of the runner.
    pub id: String,
    /// Command name.
    pub command: String,
    /// Capture time, epoch milliseconds.
    pub epoch: i64,
    pub stats: Option<ProcessStats>,
}

pub(crate) struct Job {
    pub(crate) runner: Runner,
    pub(crate) process: Box<dyn Process>,
}

pub(crate) struct PmInner {
    pub(crate) cfg: PmConfig,
    factories: FactoryRegistry,
    live: Mutex<HashMap<String, Runner>>,
    pool: Arc<Semaphore>,
    pub(crate) queues: queues::QueueTable,
    messages: broadcast::Sender<Message>,
    results: Mutex<Vec<mpsc::UnboundedSender<JobResult>>>,
    stats: broadcast::Sender<RunnerSnapshot>,
    aggregator: Arc<Aggregator>,
}

/// Handle to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<PmInner>,
}

impl ProcessManager {
    /// Builds the scheduler around a startup-time factory registry. The
    /// registry is read-only from here on.
    pub fn new(cfg: PmConfig, factories: FactoryRegistry) -> Self {
        let (messages, _) = broadcast::channel(cfg.channel_capacity);
        let (stats, _) = broadcast::channel(cfg.channel_capacity);
        Self {
            inner: Arc::new(PmInner {
                pool: Arc::new(Semaphore::new(cfg.max_jobs)),
                cfg,
                factories,
                live: Mutex::new(HashMap::new()),
                queues: queues::QueueTable::new(),
                messages,
                results: Mutex::new(Vec::new()),
                stats,
                aggregator: Arc::new(Aggregator::new()),
            }),
        }
    }

    /// Schedules a command on the unnamed pool. Non-blocking: when the pool
    /// is saturated the command waits in an unbounded FIFO backlog.
    pub fn run(&self, cmd: Command) {
        let Some(job) = self.inner.admit(cmd) else {
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Ok(_permit) = inner.pool.clone().acquire_owned().await else {
                return;
            };
            inner.execute(job).await;
        });
    }

    /// Appends a command to the named queue selected by `args.queue`.
    /// Commands without a queue fall back to the unnamed pool.
    pub fn run_queued(&self, cmd: Command) {
        if cmd.args.queue.is_empty() {
            return self.run(cmd);
        }
        let Some(job) = self.inner.admit(cmd) else {
            return;
        };
        let queue = job.runner.cmd().args.queue.clone();
        queues::push(self.inner.clone(), &queue, job);
    }

    /// Interrupts the live runner registered under `id`. Idempotent; a
    /// missing id is a no-op.
    pub fn kill(&self, id: &str) {
        let runner = {
            let live = self
                .inner
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            live.get(id).cloned()
        };
        if let Some(runner) = runner {
            runner.kill();
        }
    }

    /// Consistent snapshot of all live runners.
    pub fn runners(&self) -> Vec<Runner> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The live runner registered under `id`, if any.
    pub fn runner(&self, id: &str) -> Option<Runner> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Subscribes to every interim message from every runner.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Subscribes to every terminal job result. Results are never dropped.
    pub fn subscribe_results(&self) -> mpsc::UnboundedReceiver<JobResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Subscribes to periodic stats snapshots of live runners.
    pub fn subscribe_stats(&self) -> broadcast::Receiver<RunnerSnapshot> {
        self.inner.stats.subscribe()
    }

    /// Feeds a sample into the aggregator, publishing difference deltas as
    /// metric messages immediately.
    pub fn aggregate(
        &self,
        op: AggregateOp,
        name: &str,
        value: f64,
        id: &str,
        tags: &[(&str, &str)],
    ) {
        if let Some(sample) = self.inner.aggregator.aggregate(op, name, value, id, tags) {
            self.publish_metric(&sample);
        }
    }

    /// Emits all pending average reductions as metric messages. Driven by
    /// an external ticker.
    pub fn flush_metrics(&self) {
        for sample in self.inner.aggregator.flush() {
            self.publish_metric(&sample);
        }
    }

    pub(crate) fn publish_metric(&self, sample: &MetricSample) {
        let Ok(line) = serde_json::to_string(sample) else {
            return;
        };
        let _ = self.inner.messages.send(Message {
            id: String::new(),
            epoch: chrono::Utc::now().timestamp_millis(),
            level: levels::METRIC,
            message: line,
            name: sample.name.clone(),
            ..Default::default()
        });
    }

    /// Drains the scheduler: waits up to `grace` for live runners to reach
    /// a terminal state, then kills the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let pending = self.runners();
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    stuck = pending.len(),
                    "shutdown grace exceeded, killing remaining runners"
                );
                for runner in &pending {
                    runner.kill();
                }
                for runner in &pending {
                    let _ = tokio::time::timeout(Duration::from_secs(2), runner.wait()).await;
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub(crate) fn from_inner(inner: Arc<PmInner>) -> Self {
        Self { inner }
    }
}

impl PmInner {
    /// Validates and registers one inbound command. Returns the job to
    /// dispatch, or delivers a synthesized DUPLICATE_ID / UNKNOWN_CMD
    /// result and returns nothing.
    fn admit(&self, cmd: Command) -> Option<Job> {
        let mut live = self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if live.contains_key(&cmd.id) {
            drop(live);
            warn!(id = %cmd.id, "rejecting command with live duplicate id");
            let mut result = JobResult::for_command(&cmd, State::DuplicateId);
            result.data = encode_payload(&AgentError::DuplicateId(cmd.id.clone()).to_string());
            self.deliver(result);
            return None;
        }

        let Some(factory) = self.factories.get(&cmd.name) else {
            drop(live);
            warn!(id = %cmd.id, name = %cmd.name, "no factory for command");
            let mut result = JobResult::for_command(&cmd, State::UnknownCmd);
            result.data = encode_payload(&AgentError::UnknownCommand(cmd.name.clone()).to_string());
            self.deliver(result);
            return None;
        };

        let process = factory(&cmd);
        let runner = Runner::new(cmd);
        live.insert(runner.cmd().id.clone(), runner.clone());
        Some(Job { runner, process })
    }

    /// Drives one job to its terminal state, then unregisters the runner
    /// and delivers the result.
    pub(crate) async fn execute(self: Arc<Self>, job: Job) {
        let Job { runner, mut process } = job;
        let cmd = runner.cmd().clone();
        let start_epoch = chrono::Utc::now().timestamp();
        let started = Instant::now();

        let outcome = if runner.token().is_cancelled() {
            Err(AgentError::Canceled)
        } else {
            runner.set_state(RunnerState::Running);
            debug!(id = %cmd.id, name = %cmd.name, "command running");
            let manager = ProcessManager::from_inner(self.clone());
            self.drive(manager, &runner, &mut process, &cmd).await
        };

        let (state, data) = match outcome {
            Ok(value) => (
                State::Success,
                serde_json::to_string(&value).unwrap_or_default(),
            ),
            Err(err) => (err.state(), encode_payload(&err.to_string())),
        };

        let result = JobResult {
            id: cmd.id.clone(),
            gid: cmd.gid,
            nid: cmd.nid,
            args: cmd.args.clone(),
            start_time: start_epoch,
            time: started.elapsed().as_millis() as i64,
            state,
            level: levels::RESULT_JSON,
            data,
            tags: cmd.args.tags.clone(),
        };

        runner.finish(result.clone());
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&cmd.id);
        self.deliver(result);
    }

    async fn drive(
        &self,
        manager: ProcessManager,
        runner: &Runner,
        process: &mut Box<dyn Process>,
        cmd: &Command,
    ) -> crate::error::Result<serde_json::Value> {
        let ctx = ExecContext::new(
            cmd.clone(),
            self.messages.clone(),
            runner.token(),
            self.aggregator.clone(),
            runner.pid_slot(),
            manager,
        );
        let token = runner.token();

        let max_time = cmd.args.max_time;
        let deadline_enabled = max_time > 0;
        let sleep = tokio::time::sleep(Duration::from_secs(if deadline_enabled {
            max_time
        } else {
            3600
        }));
        tokio::pin!(sleep);

        let stats_enabled = cmd.args.stats_interval > 0;
        let period = Duration::from_secs(cmd.args.stats_interval.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        let mut run = process.run(ctx);
        loop {
            tokio::select! {
                res = &mut run => return res,
                _ = token.cancelled() => return Err(AgentError::Canceled),
                _ = &mut sleep, if deadline_enabled => {
                    token.cancel();
                    return Err(AgentError::Timeout(Duration::from_secs(max_time)));
                }
                _ = ticker.tick(), if stats_enabled => {
                    let _ = self.stats.send(RunnerSnapshot {
                        id: cmd.id.clone(),
                        command: cmd.name.clone(),
                        epoch: chrono::Utc::now().timestamp_millis(),
                        stats: runner.stats(),
                    });
                }
            }
        }
    }

    fn deliver(&self, result: JobResult) {
        let mut subscribers = self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(result.clone()).is_ok());
    }
}

fn encode_payload(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_default()
}
