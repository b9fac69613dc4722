//! Container lifecycle commands and the result forwarder.
//!
//! Containers are lightweight isolated workloads addressed by a numeric
//! id. The manager mints ids from a guarded sequence, runs each container
//! as a `core-{id}` system-process runner, feeds per-container work lists
//! (`core:{id}`) and forwards container-produced results from the shared
//! response list back to the controller sink matching their tag.

mod queue;

pub use queue::QueueStore;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::controller::Sinks;
use crate::error::{AgentError, Result};
use crate::models::{Command, CommandArgs, JobResult};
use crate::pm::{ExecContext, FactoryRegistry, ProcessStats};

pub const CMD_CREATE: &str = "corex.create";
pub const CMD_LIST: &str = "corex.list";
pub const CMD_DISPATCH: &str = "corex.dispatch";
pub const CMD_TERMINATE: &str = "corex.terminate";

/// Shared response list fed by container processes.
pub const RESULT_QUEUE: &str = "corex:results";

const CONTAINER_PROCESS: &str = "corex";

/// Work list consumed by the container process of `id`.
pub fn work_queue(id: u64) -> String {
    format!("core:{id}")
}

fn runner_id(id: u64) -> String {
    format!("core-{id}")
}

fn parse_runner_id(name: &str) -> Option<u64> {
    name.strip_prefix("core-")?.parse().ok()
}

/// Bridge name/setup pair, serialized as a two-element array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings(pub String, pub String);

impl BridgeSettings {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn setup(&self) -> &str {
        &self.1
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zerotier: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridge: Vec<BridgeSettings>,
}

/// Arguments of `corex.create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateArguments {
    /// Root plist of the container filesystem.
    #[serde(default)]
    pub root: String,
    /// Host path (or plist URL) to guest path data mounts.
    #[serde(default)]
    pub mount: HashMap<String, String>,
    #[serde(default)]
    pub network: NetworkSettings,
    /// Host to guest port forwards.
    #[serde(default)]
    pub port: HashMap<i64, i64>,
}

impl CreateArguments {
    /// Checks the argument invariants: root present, mounts absolute or
    /// URL-backed, ports within range, bridges resolvable by name.
    fn validate(&self, sysfs_net: &Path) -> Result<()> {
        if self.root.is_empty() {
            return Err(AgentError::validation("root plist is required"));
        }

        for (host, guest) in &self.mount {
            if Url::parse(host).is_err() {
                let host_path = Path::new(host);
                if !host_path.is_absolute() {
                    return Err(AgentError::validation(format!(
                        "host path '{host}' must be absolute"
                    )));
                }
                if !host_path.exists() {
                    return Err(AgentError::validation(format!(
                        "host path '{host}' does not exist"
                    )));
                }
            }
            if !Path::new(guest).is_absolute() {
                return Err(AgentError::validation(format!(
                    "guest path '{guest}' must be absolute"
                )));
            }
        }

        for (host, guest) in &self.port {
            if !(0..=65535).contains(host) {
                return Err(AgentError::validation(format!("invalid host port '{host}'")));
            }
            if !(0..=65535).contains(guest) {
                return Err(AgentError::validation(format!(
                    "invalid guest port '{guest}'"
                )));
            }
        }

        for bridge in &self.network.bridge {
            if !sysfs_net.join(bridge.name()).join("bridge").is_dir() {
                return Err(AgentError::validation(format!(
                    "bridge '{}' does not exist",
                    bridge.name()
                )));
            }
        }

        Ok(())
    }
}

/// Arguments of `corex.dispatch`.
#[derive(Debug, Deserialize)]
pub struct DispatchArguments {
    pub container: u64,
    pub command: Command,
}

/// Arguments of `corex.terminate`.
#[derive(Debug, Deserialize)]
pub struct TerminateArguments {
    pub container: u64,
}

/// Container bridge settings.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container process binary, launched once per created container.
    pub binary: PathBuf,
    /// Argument template for the container process; `{key}` placeholders
    /// resolve against the start payload (container, root, ...).
    pub args: Vec<String>,
    /// Where bridge links are resolved by name.
    pub sysfs_net: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("coreX"),
            args: vec![
                "--id".to_string(),
                "{container}".to_string(),
                "--root".to_string(),
                "{root}".to_string(),
            ],
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Owns the container id sequence, the work lists and the lifecycle
/// command handlers.
pub struct ContainerManager {
    sequence: Mutex<u64>,
    store: Arc<QueueStore>,
    config: ContainerConfig,
}

impl ContainerManager {
    pub fn new(store: Arc<QueueStore>, config: ContainerConfig) -> Arc<Self> {
        Arc::new(Self {
            sequence: Mutex::new(0),
            store,
            config,
        })
    }

    /// Registers the container command factories plus the container
    /// process itself.
    pub fn register(self: &Arc<Self>, registry: &mut FactoryRegistry) {
        registry.register_system(
            CONTAINER_PROCESS,
            self.config.binary.clone(),
            self.config.args.clone(),
            None,
        );

        let mgr = self.clone();
        registry.register_internal(CMD_CREATE, move |ctx| {
            let mgr = mgr.clone();
            async move { mgr.create(ctx).await }
        });

        let mgr = self.clone();
        registry.register_internal(CMD_LIST, move |ctx| {
            let mgr = mgr.clone();
            async move { mgr.list(ctx).await }
        });

        let mgr = self.clone();
        registry.register_internal(CMD_DISPATCH, move |ctx| {
            let mgr = mgr.clone();
            async move { mgr.dispatch(ctx).await }
        });

        let mgr = self.clone();
        registry.register_internal(CMD_TERMINATE, move |ctx| {
            let mgr = mgr.clone();
            async move { mgr.terminate(ctx).await }
        });
    }

    fn next_sequence(&self) -> u64 {
        let mut seq = self
            .sequence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *seq += 1;
        *seq
    }

    /// Validates the arguments, allocates the next id and starts the
    /// container runner. Returns the id.
    async fn create(&self, ctx: ExecContext) -> Result<Value> {
        let args: CreateArguments = serde_json::from_value(ctx.cmd().arguments.clone())?;
        args.validate(&self.config.sysfs_net)?;

        let id = self.next_sequence();
        let cmd = Command {
            id: runner_id(id),
            gid: ctx.cmd().gid,
            nid: ctx.cmd().nid,
            name: CONTAINER_PROCESS.to_string(),
            args: CommandArgs {
                tags: ctx.cmd().route.clone(),
                ..Default::default()
            },
            arguments: json!({
                "container": id,
                "root": args.root,
                "mount": args.mount,
                "port": args.port,
                "network": args.network,
            }),
            route: ctx.cmd().route.clone(),
        };
        ctx.manager().run(cmd);
        debug!(container = id, "container started");

        Ok(json!(id))
    }

    /// Reports the stats snapshot of every live `core-{id}` runner.
    async fn list(&self, ctx: ExecContext) -> Result<Value> {
        let mut containers: HashMap<u64, Option<ProcessStats>> = HashMap::new();
        for runner in ctx.manager().runners() {
            if let Some(id) = parse_runner_id(&runner.cmd().id) {
                containers.insert(id, runner.stats());
            }
        }
        Ok(serde_json::to_value(containers)?)
    }

    /// Serializes the inner command onto the container's work list with a
    /// freshly minted result id and the outer command's route as its tag.
    async fn dispatch(&self, ctx: ExecContext) -> Result<Value> {
        let args: DispatchArguments = serde_json::from_value(ctx.cmd().arguments.clone())?;
        if args.container == 0 {
            return Err(AgentError::validation("invalid container id"));
        }
        if ctx
            .manager()
            .runner(&runner_id(args.container))
            .is_none()
        {
            return Err(AgentError::validation("container does not exist"));
        }

        let mut inner = args.command;
        let id = Uuid::new_v4().to_string();
        inner.id = id.clone();
        inner.args.set_tag(&ctx.cmd().route);

        let payload = serde_json::to_string(&inner)?;
        self.store.push_back(&work_queue(args.container), payload);
        debug!(container = args.container, result = %id, "command dispatched");

        Ok(json!(id))
    }

    /// Kills the container runner. No result body.
    async fn terminate(&self, ctx: ExecContext) -> Result<Value> {
        let args: TerminateArguments = serde_json::from_value(ctx.cmd().arguments.clone())?;
        ctx.manager().kill(&runner_id(args.container));
        Ok(Value::Null)
    }
}

/// Moves container-produced results from the shared response list onto the
/// sink matching their tag. The loop outlives every error: undecodable
/// payloads are dropped, delivery failures back off 2 s and continue.
pub fn spawn_forwarder(
    store: Arc<QueueStore>,
    sinks: Arc<Sinks>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("container result forwarder started");
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => return,
                payload = store.pop_front(RESULT_QUEUE) => payload,
            };

            let result: JobResult = match serde_json::from_str(&payload) {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "discarding undecodable container result");
                    continue;
                }
            };

            match sinks.get(&result.tags) {
                Some(sink) => {
                    debug!(tags = %result.tags, id = %result.id, "forwarding container result");
                    if let Err(e) = sink.respond(&result).await {
                        warn!(error = %e, "container result delivery failed");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
                None => {
                    warn!(tags = %result.tags, "container result for unknown sink");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_requires_a_root_plist() {
        let args = CreateArguments::default();
        let err = args.validate(Path::new("/sys/class/net")).unwrap_err();
        assert!(err.to_string().contains("root plist"));
    }

    #[test]
    fn create_accepts_url_backed_mounts() {
        let mut args = CreateArguments {
            root: "https://hub/flist/base.flist".into(),
            ..Default::default()
        };
        args.mount.insert(
            "ipfs://QmHash".into(),
            "/data".into(),
        );
        assert!(args.validate(Path::new("/sys/class/net")).is_ok());
    }

    #[test]
    fn create_rejects_relative_host_mounts() {
        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.mount.insert("relative/path".into(), "/data".into());
        let err = args.validate(Path::new("/sys/class/net")).unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn create_rejects_relative_guest_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().to_string_lossy().to_string();
        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.mount.insert(host, "data".into());
        let err = args.validate(Path::new("/sys/class/net")).unwrap_err();
        assert!(err.to_string().contains("guest path"));
    }

    #[test]
    fn create_rejects_missing_host_mounts() {
        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.mount
            .insert("/definitely/not/here".into(), "/data".into());
        let err = args.validate(Path::new("/sys/class/net")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn create_rejects_out_of_range_ports() {
        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.port.insert(80, 70000);
        let err = args.validate(Path::new("/sys/class/net")).unwrap_err();
        assert!(err.to_string().contains("invalid guest port"));
    }

    #[test]
    fn create_rejects_unresolvable_bridges() {
        let tmp = tempfile::tempdir().unwrap();
        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.network
            .bridge
            .push(BridgeSettings("br-missing".into(), "none".into()));
        let err = args.validate(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("br-missing"));
    }

    #[test]
    fn create_resolves_bridges_through_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("br0").join("bridge")).unwrap();

        let mut args = CreateArguments {
            root: "base.flist".into(),
            ..Default::default()
        };
        args.network
            .bridge
            .push(BridgeSettings("br0".into(), "dhcp".into()));
        assert!(args.validate(tmp.path()).is_ok());
    }

    #[test]
    fn runner_names_round_trip_container_ids() {
        assert_eq!(runner_id(7), "core-7");
        assert_eq!(parse_runner_id("core-7"), Some(7));
        assert_eq!(parse_runner_id("core-x"), None);
        assert_eq!(parse_runner_id("ping"), None);
        assert_eq!(work_queue(7), "core:7");
    }

    #[test]
    fn bridge_settings_serialize_as_pairs() {
        let bridge = BridgeSettings("br0".into(), "dhcp".into());
        let encoded = serde_json::to_string(&bridge).unwrap();
        assert_eq!(encoded, r#"["br0","dhcp"]"#);

        let decoded: BridgeSettings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.name(), "br0");
        assert_eq!(decoded.setup(), "dhcp");
    }
}
