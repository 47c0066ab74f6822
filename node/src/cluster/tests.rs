use super::*;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time;

use crate::cert::CertStore;
use crate::audit::EntryKind;
use crate::config::{load_config_from_str, Config};
use crate::control::{build_http_client, TokenManager};
use crate::database::{CounterStore, MemoryCounterStore};
use crate::error::{NodeError, NodeResult};
use crate::event::EventBus;
use crate::socketio::{ChannelEvent, Connection, Connector, ControlChannel};
use crate::storage::StorageManager;
use crate::task::TaskGroup;

/// A scripted control plane.
///
/// Events without a scripted reply are acknowledged the way a healthy
/// control plane would.
#[derive(Debug, Default)]
struct FakeControlPlane {
    emitted: Mutex<Vec<(String, Option<Value>)>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

#[derive(Debug)]
struct FakeConnector(Arc<FakeControlPlane>);

#[derive(Debug)]
struct FakeChannel(Arc<FakeControlPlane>);

impl FakeControlPlane {
    fn script(&self, event: &str, replies: impl IntoIterator<Item = Result<Value, String>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .extend(replies);
    }

    /// Holds every acknowledgement of `event` back for `delay`.
    fn delay(&self, event: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(event.to_string(), delay);
    }

    fn payloads(&self, event: &str) -> Vec<Option<Value>> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn count(&self, event: &str) -> usize {
        self.payloads(event).len()
    }

    fn push(&self, event: ChannelEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().unwrap().send(event).unwrap();
    }

    fn reply(&self, event: &str) -> Result<Value, String> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(event)
            .and_then(|replies| replies.pop_front());

        scripted.unwrap_or_else(|| {
            Ok(match event {
                "enable" | "disable" => json!(true),
                "keep-alive" => json!(Utc::now().to_rfc3339()),
                "request-cert" => json!({ "cert": "PEM1", "key": "PEM2" }),
                _ => Value::Null,
            })
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, token: &str) -> NodeResult<Connection> {
        assert_eq!("t", token);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.events.lock().unwrap() = Some(tx);

        Ok(Connection {
            channel: Arc::new(FakeChannel(self.0.clone())),
            events: rx,
        })
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn emit(
        &self,
        event: &str,
        payload: Option<Value>,
        _timeout: Duration,
    ) -> NodeResult<Value> {
        self.0
            .emitted
            .lock()
            .unwrap()
            .push((event.to_string(), payload));

        let delay = self.0.delays.lock().unwrap().get(event).copied();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }

        self.0
            .reply(event)
            .map_err(|error| NodeError::ControlPlaneError {
                event: event.to_string(),
                error,
            })
    }

    async fn close(&self) {}
}

struct Harness {
    dir: TempDir,
    config: Arc<Config>,
    plane: Arc<FakeControlPlane>,
    storages: Arc<StorageManager>,
    counter_store: Arc<MemoryCounterStore>,
    events: EventBus,
    group: TaskGroup,
}

impl Harness {
    /// Sets up a node with one cluster "c1" and one local storage.
    ///
    /// `top` is prepended to the configuration.
    async fn new(top: &str, keepalive_interval: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();

        let config = load_config_from_str(&format!(
            r#"
{top}
cluster_status_dir = "{root}/status"

[[clusters]]
id = "c1"
secret = "s"

[[storages]]
id = "local"
type = "local"
path = "{root}/data"

[cert]
dir = "{root}/ssl"

[keepalive]
interval = "{keepalive_interval}"
"#
        ))
        .unwrap();

        let events = EventBus::new();
        let storages = Arc::new(
            StorageManager::from_config(&config, events.clone())
                .await
                .unwrap(),
        );

        Self {
            dir,
            config: Arc::new(config),
            plane: Arc::new(FakeControlPlane::default()),
            storages,
            counter_store: Arc::new(MemoryCounterStore::new()),
            events,
            group: TaskGroup::new(),
        }
    }

    fn set_storage_online(&self, online: bool) {
        self.storages.storages()[0].set_online(online);
        self.storages.refresh();
    }

    async fn manager(&self) -> Arc<ClusterManager> {
        let tokens = Arc::new(TokenManager::new(
            "c1".to_string(),
            "s".to_string(),
            Url::parse("http://127.0.0.1:9/").unwrap(),
            build_http_client().unwrap(),
        ));
        tokens.set_token("t".to_string());

        let manager = ClusterManager::from_config(
            self.config.clone(),
            vec![tokens],
            Arc::new(FakeConnector(self.plane.clone())),
            self.storages.clone(),
            self.counter_store.clone(),
            self.events.clone(),
            &self.group,
        )
        .await
        .unwrap();

        Arc::new(manager)
    }

    /// Returns a connected agent.
    async fn agent(&self) -> Arc<ClusterAgent> {
        let manager = self.manager().await;
        let agent = manager.get("c1").unwrap().clone();
        agent.connect().await.unwrap();
        agent
    }
}

async fn wait_for_state(agent: &ClusterAgent, state: ClusterState) {
    let mut rx = agent.watch_state();
    time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {}", state))
        .unwrap();
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn test_counters() {
    let counters = Counters::new();
    counters.record(100);
    counters.record(50);

    let snapshot = counters.snapshot();
    assert_eq!(CounterSnapshot { hits: 2, bytes: 150 }, snapshot);

    // Served while the report was in flight
    counters.record(10);
    counters.subtract(&snapshot);

    assert_eq!(CounterSnapshot { hits: 1, bytes: 10 }, counters.snapshot());
}

#[test]
fn test_enable_retry_delay() {
    assert_eq!(Duration::from_secs(300), agent::enable_retry_delay(1));
    assert_eq!(Duration::from_secs(1500), agent::enable_retry_delay(5));
    assert_eq!(Duration::from_secs(3600), agent::enable_retry_delay(20));
}

#[tokio::test]
async fn test_enable() {
    let harness = Harness::new("", "1h").await;
    harness.set_storage_online(true);

    let agent = harness.agent().await;
    assert_eq!(ClusterState::Connected, agent.state());

    agent.enable().await.unwrap();
    assert_eq!(ClusterState::Enabled, agent.state());

    let payload = harness.plane.payloads("enable")[0].clone().unwrap();
    assert_eq!(json!(4000), payload["port"]);
    assert_eq!(json!(agent::PROTOCOL_VERSION), payload["version"]);
    assert_eq!(json!(false), payload["byoc"]);
    assert_eq!(json!("local"), payload["flavor"]["storage"]);

    // Already enabled
    agent.enable().await.unwrap();
    assert_eq!(1, harness.plane.count("enable"));
}

#[tokio::test]
async fn test_enable_without_storage() {
    let harness = Harness::new("", "1h").await;
    let agent = harness.agent().await;

    assert!(matches!(
        agent.enable().await,
        Err(NodeError::NoOnlineStorage)
    ));
    assert_eq!(0, harness.plane.count("enable"));
    assert_eq!(ClusterState::Connected, agent.state());
}

#[tokio::test]
async fn test_enable_failure() {
    let harness = Harness::new(
        "cluster_up_failed_times = 2\ncluster_up_failed_interval = \"1h\"",
        "1h",
    )
    .await;
    harness.set_storage_online(true);
    harness.plane.script(
        "enable",
        [Err("no".to_string()), Err("still no".to_string())],
    );

    let agent = harness.agent().await;

    assert!(matches!(
        agent.enable().await,
        Err(NodeError::ControlPlaneError { .. })
    ));
    assert_eq!(ClusterState::Connected, agent.state());
    assert_eq!(1, agent.retry_times());

    assert!(agent.enable().await.is_err());
    assert_eq!(2, agent.retry_times());

    // The failure budget is spent, so the next attempt waits
    assert!(time::timeout(Duration::from_millis(200), agent.enable())
        .await
        .is_err());
    assert_eq!(2, harness.plane.count("enable"));
}

#[tokio::test]
async fn test_enable_storage_lost_while_waiting() {
    let harness = Harness::new(
        "cluster_up_failed_times = 1\ncluster_up_failed_interval = \"300ms\"",
        "1h",
    )
    .await;
    harness.set_storage_online(true);
    harness.plane.script("enable", [Err("no".to_string())]);

    let agent = harness.agent().await;
    assert!(agent.enable().await.is_err());

    // Waits out the failure budget
    let pending = tokio::spawn({
        let agent = agent.clone();
        async move { agent.enable().await }
    });
    time::sleep(Duration::from_millis(50)).await;
    harness.set_storage_online(false);

    assert!(matches!(
        pending.await.unwrap(),
        Err(NodeError::NoOnlineStorage)
    ));
    assert_eq!(1, harness.plane.count("enable"));
    assert_eq!(ClusterState::Connected, agent.state());
}

#[tokio::test]
async fn test_disable_while_enabling() {
    let harness = Harness::new("", "50ms").await;
    harness.set_storage_online(true);
    harness.plane.delay("enable", Duration::from_millis(300));

    let agent = harness.agent().await;
    let pending = tokio::spawn({
        let agent = agent.clone();
        async move { agent.enable().await }
    });
    wait_for_state(&agent, ClusterState::WantEnable).await;

    agent.disable().await.unwrap();
    assert_eq!(ClusterState::Connected, agent.state());

    // The late acknowledgement does not enable the cluster
    pending.await.unwrap().unwrap();
    assert_eq!(ClusterState::Connected, agent.state());

    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(0, harness.plane.count("keep-alive"));
}

#[tokio::test]
async fn test_keep_alive() {
    let harness = Harness::new("", "1h").await;
    harness.set_storage_online(true);

    let agent = harness.agent().await;

    // Nothing is reported before the cluster is enabled
    assert!(!agent.keep_alive().await);

    agent.enable().await.unwrap();

    agent.counters().record(100);
    agent.counters().record(100);
    assert!(agent.keep_alive().await);

    let payload = harness.plane.payloads("keep-alive")[0].clone().unwrap();
    assert_eq!(json!(2), payload["hits"]);
    assert_eq!(json!(200), payload["bytes"]);
    assert!(payload["time"].is_i64());
    assert!(agent.counters().snapshot().is_empty());

    agent.counters().record(50);
    assert!(agent.keep_alive().await);

    // A refused report keeps the counts for the next one
    harness.plane.script("keep-alive", [Ok(Value::Null)]);
    agent.counters().record(7);
    assert!(!agent.keep_alive().await);
    assert_eq!(
        CounterSnapshot { hits: 1, bytes: 7 },
        agent.counters().snapshot()
    );

    let stored = harness.counter_store.get_counters("c1", 0).await.unwrap();
    let hits: u64 = stored.iter().map(|counter| counter.hits).sum();
    let bytes: u64 = stored.iter().map(|counter| counter.bytes).sum();
    assert_eq!((3, 250), (hits, bytes));
}

#[tokio::test]
async fn test_kicked() {
    let harness = Harness::new("", "50ms").await;
    harness.set_storage_online(true);
    harness
        .plane
        .script("keep-alive", [Ok(Value::Null), Ok(Value::Null), Ok(Value::Null)]);

    let agent = harness.agent().await;
    agent.enable().await.unwrap();

    eventually("the cluster to be disabled", || {
        harness.plane.count("disable") == 1
    })
    .await;
    wait_for_state(&agent, ClusterState::Connected).await;

    let sent = harness.plane.count("keep-alive");
    assert!(sent >= 3);
    assert_eq!(1, agent.retry_times());

    // Being kicked is not an enable failure
    let entries = agent.status_log().read_entries().await.unwrap();
    assert!(entries.iter().any(|entry| entry.kind == EntryKind::Kicked));
    assert!(!entries.iter().any(|entry| entry.kind == EntryKind::EnableFailed));
    assert_eq!(
        Duration::ZERO,
        agent
            .status_log()
            .enable_wait(Utc::now(), Duration::from_secs(3600), 1)
            .await
    );

    // Keep-alives stop along with the cluster
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sent, harness.plane.count("keep-alive"));
}

#[tokio::test]
async fn test_request_cert() {
    let harness = Harness::new("", "1h").await;
    let manager = harness.manager().await;
    manager.get("c1").unwrap().connect().await.unwrap();

    let certs = CertStore::new(None);
    let paths = manager.request_cert(&certs).await.unwrap();

    let ssl = harness.dir.path().join("ssl");
    assert_eq!(ssl.join("c1.pem"), paths.cert);
    assert_eq!(ssl.join("c1.key"), paths.key);
    assert_eq!("PEM1", tokio::fs::read_to_string(&paths.cert).await.unwrap());
    assert_eq!("PEM2", tokio::fs::read_to_string(&paths.key).await.unwrap());
    assert_eq!(Some(paths), certs.current());
}

#[tokio::test]
async fn test_request_cert_refused() {
    let harness = Harness::new("", "1h").await;
    harness
        .plane
        .script("request-cert", [Err("not allowed".to_string())]);

    let manager = harness.manager().await;
    manager.get("c1").unwrap().connect().await.unwrap();

    let certs = CertStore::new(None);
    assert_eq!(None, manager.request_cert(&certs).await);
    assert_eq!(None, certs.current());
}

#[tokio::test]
async fn test_follow_storages() {
    let harness = Harness::new("", "1h").await;
    harness.set_storage_online(true);

    let manager = harness.manager().await;
    manager.start().await;

    let agent = manager.get("c1").unwrap().clone();
    assert_eq!(ClusterState::Enabled, agent.state());

    harness.set_storage_online(false);
    wait_for_state(&agent, ClusterState::Connected).await;
    assert_eq!(1, harness.plane.count("disable"));

    harness.set_storage_online(true);
    wait_for_state(&agent, ClusterState::Enabled).await;
    assert_eq!(2, harness.plane.count("enable"));

    manager.stop().await;
    assert_eq!(ClusterState::Disconnected, agent.state());
    assert_eq!(2, harness.plane.count("disable"));
}

#[tokio::test]
async fn test_storage_lost_while_resuming() {
    let harness = Harness::new("", "1h").await;
    harness.set_storage_online(true);

    let manager = harness.manager().await;
    manager.start().await;

    let agent = manager.get("c1").unwrap().clone();
    assert_eq!(ClusterState::Enabled, agent.state());

    harness.set_storage_online(false);
    wait_for_state(&agent, ClusterState::Connected).await;

    harness.plane.delay("enable", Duration::from_secs(1));
    harness.set_storage_online(true);
    eventually("the cluster to be enabled again", || {
        harness.plane.count("enable") == 2
    })
    .await;

    // Handled while the enable is still unacknowledged
    harness.set_storage_online(false);
    time::timeout(
        Duration::from_millis(500),
        eventually("the cluster to be disabled again", || {
            harness.plane.count("disable") == 2
        }),
    )
    .await
    .unwrap();

    time::sleep(Duration::from_millis(800)).await;
    assert_eq!(ClusterState::Connected, agent.state());

    manager.stop().await;
}

#[tokio::test]
async fn test_disconnect() {
    let harness = Harness::new("", "1h").await;
    harness.set_storage_online(true);

    let agent = harness.agent().await;
    agent.enable().await.unwrap();

    harness.plane.push(ChannelEvent::Event {
        name: "message".to_string(),
        args: vec![json!("hello")],
    });
    harness.plane.push(ChannelEvent::Disconnected {
        reason: "transport close".to_string(),
    });

    wait_for_state(&agent, ClusterState::Connecting).await;
    assert!(!agent.keep_alive().await);
    assert_eq!(0, harness.plane.count("keep-alive"));

    harness.group.shutdown().await;
}
