//! End-to-end tests for the container bridge: lifecycle commands through
//! the process manager and result routing through the forwarder.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_lib::containers::{
    spawn_forwarder, ContainerConfig, ContainerManager, QueueStore, RESULT_QUEUE,
};
use agent_lib::controller::{Sink, Sinks};
use agent_lib::models::{levels, Command, JobResult, State};
use agent_lib::pm::{FactoryRegistry, PmConfig, ProcessManager};
use agent_lib::{builtin::register_builtins, Result};

/// Sink that records every delivered result.
struct RecordingSink {
    key: String,
    hits: Mutex<Vec<JobResult>>,
}

impl RecordingSink {
    fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            hits: Mutex::new(Vec::new()),
        })
    }

    fn results(&self) -> Vec<JobResult> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn key(&self) -> &str {
        &self.key
    }

    async fn respond(&self, result: &JobResult) -> Result<()> {
        self.hits.lock().unwrap().push(result.clone());
        Ok(())
    }
}

fn test_result(id: &str, tags: &str) -> String {
    serde_json::to_string(&JobResult {
        id: id.into(),
        gid: 1,
        nid: 2,
        args: Default::default(),
        start_time: 1_700_000_000,
        time: 12,
        state: State::Success,
        level: levels::RESULT_JSON,
        data: "\"pong\"".into(),
        tags: tags.into(),
    })
    .unwrap()
}

fn container_runtime(store: Arc<QueueStore>) -> ProcessManager {
    let config = ContainerConfig {
        binary: PathBuf::from("/bin/sleep"),
        args: vec!["30".to_string()],
        sysfs_net: std::env::temp_dir(),
    };
    let manager = ContainerManager::new(store, config);

    let mut registry = FactoryRegistry::new();
    register_builtins(&mut registry);
    manager.register(&mut registry);

    ProcessManager::new(PmConfig::default(), registry)
}

fn routed_command(id: &str, name: &str, route: &str, arguments: serde_json::Value) -> Command {
    let mut cmd = Command {
        id: id.into(),
        gid: 1,
        nid: 2,
        name: name.into(),
        arguments,
        route: route.into(),
        ..Default::default()
    };
    cmd.args.set_tag(route);
    cmd
}

/// Collects results as they arrive so out-of-order deliveries (e.g. a
/// container runner finishing concurrently) are not lost.
struct ResultCollector {
    rx: tokio::sync::mpsc::UnboundedReceiver<JobResult>,
    seen: std::collections::HashMap<String, JobResult>,
}

impl ResultCollector {
    fn new(rx: tokio::sync::mpsc::UnboundedReceiver<JobResult>) -> Self {
        Self {
            rx,
            seen: std::collections::HashMap::new(),
        }
    }

    async fn take(&mut self, id: &str) -> JobResult {
        if let Some(result) = self.seen.remove(id) {
            return result;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let result = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .expect("timed out waiting for a result")
                .expect("result channel closed");
            if result.id == id {
                return result;
            }
            self.seen.insert(result.id.clone(), result);
        }
    }
}

#[tokio::test]
async fn dispatch_routes_through_the_matching_sink_only() {
    let store = Arc::new(QueueStore::new());
    let k1 = RecordingSink::new("K1");
    let k2 = RecordingSink::new("K2");

    let mut sinks = Sinks::new();
    sinks.insert(k1.clone());
    sinks.insert(k2.clone());

    let shutdown = CancellationToken::new();
    spawn_forwarder(store.clone(), Arc::new(sinks), shutdown.clone());

    store.push_back(RESULT_QUEUE, test_result("x", "K1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let delivered = k1.results();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, "x");
    assert_eq!(delivered[0].tags, "K1");
    assert!(k2.results().is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn forwarder_survives_garbage_and_unknown_tags() {
    let store = Arc::new(QueueStore::new());
    let k1 = RecordingSink::new("K1");

    let mut sinks = Sinks::new();
    sinks.insert(k1.clone());

    let shutdown = CancellationToken::new();
    spawn_forwarder(store.clone(), Arc::new(sinks), shutdown.clone());

    store.push_back(RESULT_QUEUE, "not json at all".into());
    store.push_back(RESULT_QUEUE, test_result("orphan", "K9"));
    store.push_back(RESULT_QUEUE, test_result("kept", "K1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let delivered = k1.results();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, "kept");

    shutdown.cancel();
}

#[tokio::test]
async fn container_lifecycle_create_dispatch_list_terminate() {
    let store = Arc::new(QueueStore::new());
    let pm = container_runtime(store.clone());
    let mut results = ResultCollector::new(pm.subscribe_results());

    // create: allocates id 1 and starts the core-1 runner.
    pm.run(routed_command(
        "c1",
        "corex.create",
        "K1",
        json!({"root": "https://hub/base.flist"}),
    ));
    let created = results.take("c1").await;
    assert_eq!(created.state, State::Success);
    assert_eq!(created.data, "1");
    assert!(pm.runner("core-1").is_some());

    // dispatch: mints a result id and lands the inner command on core:1.
    pm.run(routed_command(
        "d1",
        "corex.dispatch",
        "K1",
        json!({"container": 1, "command": {"id": "inner", "name": "ping"}}),
    ));
    let dispatched = results.take("d1").await;
    assert_eq!(dispatched.state, State::Success);
    let minted: String = serde_json::from_str(&dispatched.data).unwrap();
    assert!(!minted.is_empty());

    let payload = store.try_pop_front("core:1").expect("work queue empty");
    let inner: Command = serde_json::from_str(&payload).unwrap();
    assert_eq!(inner.id, minted);
    assert_eq!(inner.name, "ping");
    assert_eq!(inner.args.tags, "K1");

    // list: reports the live container with its stats snapshot.
    pm.run(routed_command("l1", "corex.list", "K1", json!({})));
    let listed = results.take("l1").await;
    assert_eq!(listed.state, State::Success);
    let containers: serde_json::Value = serde_json::from_str(&listed.data).unwrap();
    assert!(containers.get("1").is_some());

    // terminate: kills the runner; the container's own result is KILLED.
    pm.run(routed_command(
        "t1",
        "corex.terminate",
        "K1",
        json!({"container": 1}),
    ));
    let terminated = results.take("t1").await;
    assert_eq!(terminated.state, State::Success);

    let container_result = results.take("core-1").await;
    assert_eq!(container_result.state, State::Killed);
    assert_eq!(container_result.tags, "K1");
    assert!(pm.runner("core-1").is_none());
}

#[tokio::test]
async fn dispatch_to_a_missing_container_fails_validation() {
    let store = Arc::new(QueueStore::new());
    let pm = container_runtime(store.clone());
    let mut results = ResultCollector::new(pm.subscribe_results());

    pm.run(routed_command(
        "d-missing",
        "corex.dispatch",
        "K1",
        json!({"container": 42, "command": {"name": "ping"}}),
    ));
    let result = results.take("d-missing").await;
    assert_eq!(result.state, State::Error);
    assert!(result.data.contains("does not exist"));

    assert!(store.is_empty("core:42"));
}

#[tokio::test]
async fn create_with_invalid_arguments_fails_validation() {
    let store = Arc::new(QueueStore::new());
    let pm = container_runtime(store.clone());
    let mut results = ResultCollector::new(pm.subscribe_results());

    pm.run(routed_command("bad", "corex.create", "K1", json!({})));
    let result = results.take("bad").await;
    assert_eq!(result.state, State::Error);
    assert!(result.data.contains("root plist"));
    assert!(pm.runner("core-1").is_none());
}
