//! Runner: exclusive owner of one in-flight command.
//!
//! A runner tracks the execution state machine
//! `Pending -> Running -> (Success | Error | Timeout | Killed)`; terminal
//! states are absorbing. `kill` is idempotent and safe before execution
//! starts; `wait` resolves to the terminal job result.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::{Command, JobResult, State};

/// Execution state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Killed,
}

impl RunnerState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunnerState::Pending | RunnerState::Running)
    }
}

impl From<State> for RunnerState {
    fn from(state: State) -> Self {
        match state {
            State::Success => RunnerState::Success,
            State::Timeout => RunnerState::Timeout,
            State::Killed => RunnerState::Killed,
            _ => RunnerState::Error,
        }
    }
}

/// Point-in-time resource usage of a process-backed runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Accumulated user + system CPU time, seconds.
    pub cpu_seconds: f64,
    /// Resident set size, bytes.
    pub rss_bytes: u64,
    /// Virtual memory size, bytes.
    pub vms_bytes: u64,
    pub threads: u64,
}

struct RunnerInner {
    cmd: Command,
    token: CancellationToken,
    state: watch::Sender<RunnerState>,
    result: watch::Sender<Option<JobResult>>,
    pid: Arc<Mutex<Option<u32>>>,
}

/// Handle to one executing command. Cheap to clone; all clones observe the
/// same state machine.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub(crate) fn new(cmd: Command) -> Self {
        let (state, _) = watch::channel(RunnerState::Pending);
        let (result, _) = watch::channel(None);
        Self {
            inner: Arc::new(RunnerInner {
                cmd,
                token: CancellationToken::new(),
                state,
                result,
                pid: Arc::new(Mutex::new(None)),
            }),
        }
    }

    /// The command this runner executes.
    pub fn cmd(&self) -> &Command {
        &self.inner.cmd
    }

    /// Current execution state.
    pub fn state(&self) -> RunnerState {
        *self.inner.state.borrow()
    }

    /// Interrupts execution. Idempotent; valid before `run` begins, in
    /// which case the runner goes straight to `Killed`.
    pub fn kill(&self) {
        self.inner.token.cancel();
    }

    /// Resolves once the runner reaches a terminal state.
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.inner.result.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return JobResult::for_command(&self.inner.cmd, State::Error);
            }
        }
    }

    /// Pid of the backing process, when one exists.
    pub fn pid(&self) -> Option<u32> {
        *self
            .inner
            .pid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Resource usage snapshot; `None` for purely in-process commands.
    pub fn stats(&self) -> Option<ProcessStats> {
        self.pid().and_then(read_proc_stats)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn pid_slot(&self) -> Arc<Mutex<Option<u32>>> {
        self.inner.pid.clone()
    }

    pub(crate) fn set_state(&self, next: RunnerState) {
        self.inner.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Records the terminal result. The first call wins; later calls are
    /// ignored.
    pub(crate) fn finish(&self, result: JobResult) {
        self.set_state(result.state.into());
        self.inner.result.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }
}

fn read_proc_stats(pid: u32) -> Option<ProcessStats> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&stat)
}

/// Extracts cpu/rss/threads from a `/proc/{pid}/stat` line. Fields are
/// numbered per proc(5); everything after the parenthesized command name
/// starts at field 3.
fn parse_proc_stat(content: &str) -> Option<ProcessStats> {
    const TICKS_PER_SECOND: f64 = 100.0;
    const PAGE_SIZE: u64 = 4096;

    let rest = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    let threads: u64 = fields.get(17)?.parse().ok()?;
    let vsize: u64 = fields.get(20)?.parse().ok()?;
    let rss_pages: i64 = fields.get(21)?.parse().ok()?;

    Some(ProcessStats {
        cpu_seconds: (utime + stime) / TICKS_PER_SECOND,
        rss_bytes: rss_pages.max(0) as u64 * PAGE_SIZE,
        vms_bytes: vsize,
        threads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        let runner = Runner::new(Command::default());
        assert_eq!(runner.state(), RunnerState::Pending);

        runner.set_state(RunnerState::Running);
        runner.set_state(RunnerState::Success);
        assert_eq!(runner.state(), RunnerState::Success);

        runner.set_state(RunnerState::Killed);
        assert_eq!(runner.state(), RunnerState::Success);
    }

    #[test]
    fn first_result_wins() {
        let cmd = Command {
            id: "r".into(),
            name: "ping".into(),
            ..Default::default()
        };
        let runner = Runner::new(cmd.clone());
        runner.finish(JobResult::for_command(&cmd, State::Success));
        runner.finish(JobResult::for_command(&cmd, State::Killed));

        assert_eq!(runner.state(), RunnerState::Success);
    }

    #[tokio::test]
    async fn wait_resolves_to_finished_result() {
        let cmd = Command {
            id: "w".into(),
            name: "ping".into(),
            ..Default::default()
        };
        let runner = Runner::new(cmd.clone());
        let waiter = runner.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        runner.finish(JobResult::for_command(&cmd, State::Success));
        let result = handle.await.unwrap();
        assert_eq!(result.state, State::Success);
        assert_eq!(result.id, "w");
    }

    #[test]
    fn proc_stat_parsing_handles_spaces_in_comm() {
        let line = "1234 (some proc) S 1 1234 1234 0 -1 4194560 500 0 0 0 \
                    250 150 0 0 20 0 7 0 100 104857600 2048 18446744073709551615 \
                    1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let stats = parse_proc_stat(line).unwrap();
        assert!((stats.cpu_seconds - 4.0).abs() < f64::EPSILON);
        assert_eq!(stats.threads, 7);
        assert_eq!(stats.vms_bytes, 104_857_600);
        assert_eq!(stats.rss_bytes, 2048 * 4096);
    }

    #[test]
    fn proc_stat_parsing_rejects_garbage() {
        assert!(parse_proc_stat("not a stat line").is_none());
        assert!(parse_proc_stat("1 (x) S 1 2").is_none());
    }
}
