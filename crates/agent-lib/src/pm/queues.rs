//! Named serial queues.
//!
//! Each queue owns exactly one executor task: commands appended to the same
//! queue run strictly in submission order, and the next command only starts
//! after the previous one reached a terminal state. Queues are created
//! lazily on first use and torn down after an idle grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::pm::{Job, PmInner};

#[derive(Default)]
pub(crate) struct QueueTable {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl QueueTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Appends a job to the named queue, creating its executor on first use.
/// The table lock is held across the send so teardown cannot race a
/// delivery.
pub(crate) fn push(pm: Arc<PmInner>, name: &str, job: Job) {
    let mut job = Some(job);
    loop {
        let mut senders = pm
            .queues
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let tx = match senders.get(name) {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.insert(name.to_string(), tx.clone());
                tokio::spawn(run_queue(pm.clone(), name.to_string(), rx));
                tx
            }
        };

        let Some(current) = job.take() else {
            return;
        };
        match tx.send(current) {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                // Executor died; drop the stale entry and recreate.
                senders.remove(name);
                job = Some(returned);
            }
        }
    }
}

async fn run_queue(pm: Arc<PmInner>, name: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!(queue = %name, "named queue started");
    loop {
        match tokio::time::timeout(pm.cfg.queue_idle_grace, rx.recv()).await {
            Ok(Some(job)) => pm.clone().execute(job).await,
            Ok(None) => break,
            Err(_idle) => {
                let mut senders = pm
                    .queues
                    .senders
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match rx.try_recv() {
                    Ok(job) => {
                        drop(senders);
                        pm.clone().execute(job).await;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {
                        senders.remove(&name);
                        break;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
        }
    }
    debug!(queue = %name, "named queue stopped");
}
