//! Process implementations behind the factory registry.
//!
//! A factory maps a command to a [`Process`]: either an internal async
//! handler (builtins, container operations) or a system process spawned
//! from a configured binary. System processes stream their output lines
//! into the message fan-out and expose their pid for stats sampling.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::models::{levels, Command, Message};
use crate::pm::aggregator::{AggregateOp, Aggregator};
use crate::pm::ProcessManager;

/// Everything a running process may touch: the owning command, the message
/// fan-out, the cancellation signal, the aggregator and the manager handle.
#[derive(Clone)]
pub struct ExecContext {
    cmd: Command,
    messages: tokio::sync::broadcast::Sender<Message>,
    token: CancellationToken,
    aggregator: Arc<Aggregator>,
    pid: Arc<Mutex<Option<u32>>>,
    manager: ProcessManager,
}

impl ExecContext {
    pub(crate) fn new(
        cmd: Command,
        messages: tokio::sync::broadcast::Sender<Message>,
        token: CancellationToken,
        aggregator: Arc<Aggregator>,
        pid: Arc<Mutex<Option<u32>>>,
        manager: ProcessManager,
    ) -> Self {
        Self {
            cmd,
            messages,
            token,
            aggregator,
            pid,
            manager,
        }
    }

    /// The command this execution belongs to.
    pub fn cmd(&self) -> &Command {
        &self.cmd
    }

    /// Handle to the owning process manager.
    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Cancellation signal for this execution. Long-running handlers check
    /// it between probes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the command was killed or timed out.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Publishes an interim message owned by this command.
    pub fn emit(&self, level: i64, text: impl Into<String>) {
        let _ = self.messages.send(Message::for_command(&self.cmd, level, text));
    }

    /// Feeds a sample into the aggregator; difference reductions publish
    /// their delta as a metric message immediately.
    pub fn aggregate(&self, op: AggregateOp, name: &str, value: f64, id: &str, tags: &[(&str, &str)]) {
        if let Some(sample) = self.aggregator.aggregate(op, name, value, id, tags) {
            self.manager.publish_metric(&sample);
        }
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        *self
            .pid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pid);
    }

    pub(crate) fn clear_pid(&self) {
        *self
            .pid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

/// One executable unit produced by a factory and driven by a runner.
#[async_trait]
pub trait Process: Send {
    /// Runs the command to completion, emitting messages along the way.
    /// Invoked exactly once.
    async fn run(&mut self, ctx: ExecContext) -> Result<Value>;
}

type InternalHandler =
    Arc<dyn Fn(ExecContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// In-process command backed by an async handler. Has no pid, so its stats
/// snapshot is empty.
pub struct InternalProcess {
    handler: InternalHandler,
}

#[async_trait]
impl Process for InternalProcess {
    async fn run(&mut self, ctx: ExecContext) -> Result<Value> {
        (self.handler)(ctx).await
    }
}

/// Command backed by a child process. Stdout and stderr lines become
/// level-1/level-2 messages; cancellation kills the child.
pub struct SystemProcess {
    binary: PathBuf,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

#[async_trait]
impl Process for SystemProcess {
    async fn run(&mut self, ctx: ExecContext) -> Result<Value> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| substitute(a, &ctx.cmd().arguments))
            .collect();

        let mut builder = tokio::process::Command::new(&self.binary);
        builder
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            builder.current_dir(dir);
        }

        let mut child = builder.spawn().map_err(|e| {
            AgentError::execution(format!("spawn '{}' failed: {}", self.binary.display(), e))
        })?;

        if let Some(pid) = child.id() {
            ctx.set_pid(pid);
        }

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, levels::STDOUT, ctx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, levels::STDERR, ctx.clone());
        }

        let status = tokio::select! {
            status = child.wait() => {
                ctx.clear_pid();
                status.map_err(|e| AgentError::execution(format!("wait failed: {e}")))?
            }
            _ = ctx.token().cancelled() => {
                let _ = child.kill().await;
                ctx.clear_pid();
                return Err(AgentError::Canceled);
            }
        };

        if status.success() {
            Ok(Value::Null)
        } else {
            Err(AgentError::execution(format!(
                "exit code {}",
                status.code().unwrap_or(-1)
            )))
        }
    }
}

fn spawn_line_reader<R>(reader: R, level: i64, ctx: ExecContext)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            ctx.emit(level, line);
        }
    });
}

/// Replaces `{key}` placeholders in a configured argument with string
/// values from the command payload.
fn substitute(arg: &str, payload: &Value) -> String {
    let Some(object) = payload.as_object() else {
        return arg.to_string();
    };
    let mut out = arg.to_string();
    for (key, value) in object {
        let pattern = format!("{{{key}}}");
        if !out.contains(&pattern) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&pattern, &replacement);
    }
    out
}

/// Boxed factory: builds a fresh process for each admitted command.
pub type ProcessFactory = Box<dyn Fn(&Command) -> Box<dyn Process> + Send + Sync>;

/// Startup-time mapping from command name to process factory.
///
/// Registration happens once during bootstrap; afterwards the registry is
/// read-only. Registering the same name twice is a programmer error and
/// panics immediately.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, ProcessFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`. Panics on re-registration.
    pub fn register(&mut self, name: &str, factory: ProcessFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            panic!("process factory '{name}' registered twice");
        }
    }

    /// Registers an internal async handler under `name`.
    pub fn register_internal<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(ExecContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: InternalHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.register(
            name,
            Box::new(move |_cmd| {
                Box::new(InternalProcess {
                    handler: handler.clone(),
                })
            }),
        );
    }

    /// Registers a system command under `name`. Arguments may reference
    /// command payload fields as `{key}` placeholders.
    pub fn register_system(
        &mut self,
        name: &str,
        binary: impl Into<PathBuf>,
        args: Vec<String>,
        workdir: Option<PathBuf>,
    ) {
        let binary = binary.into();
        self.register(
            name,
            Box::new(move |_cmd| {
                Box::new(SystemProcess {
                    binary: binary.clone(),
                    args: args.clone(),
                    workdir: workdir.clone(),
                })
            }),
        );
    }

    /// True if a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ProcessFactory> {
        self.factories.get(name)
    }
}
