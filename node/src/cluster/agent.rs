//! The lifecycle of one cluster.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use derivative::Derivative;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time;

use super::{ClusterState, CounterSnapshot, Counters};
use crate::audit::{ClusterStatusLog, EntryKind};
use crate::cert::{write_cert_pair, CertPaths};
use crate::config::Config;
use crate::control::TokenManager;
use crate::database::{hour_of, CounterStore};
use crate::error::{NodeError, NodeResult};
use crate::lock::CustomLock;
use crate::socketio::{ChannelEvent, Connector, ControlChannel};
use crate::storage::StorageManager;
use crate::task::{ScheduledTask, TaskGroup};

/// The protocol version reported to the control plane.
pub const PROTOCOL_VERSION: &str = "1.10.9";

/// Base delay between failed `enable` attempts.
const ENABLE_RETRY_STEP: Duration = Duration::from_secs(300);

/// Upper bound of the delay between failed `enable` attempts.
const ENABLE_RETRY_MAX: Duration = Duration::from_secs(3600);

/// Delays between reconnection attempts.
const RECONNECT_MIN: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Timeout of acknowledgements other than `enable` and `keep-alive`.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared services of the agents.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connector>,
    pub storages: Arc<StorageManager>,
    pub counter_store: Arc<dyn CounterStore>,

    /// Serializes `enable` across clusters, unless concurrent enabling is
    /// allowed.
    pub enable_permits: Option<Arc<Semaphore>>,
}

/// A cluster and its control channel.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ClusterAgent {
    id: String,

    #[derivative(Debug = "ignore")]
    secret: String,

    display_name: Option<String>,

    context: AgentContext,
    tokens: Arc<TokenManager>,
    counters: Arc<Counters>,
    status_log: Arc<ClusterStatusLog>,

    state: watch::Sender<ClusterState>,
    channel: Mutex<Option<Arc<dyn ControlChannel>>>,

    /// Held while keep-alives must not be sent.
    keepalive_lock: CustomLock,
    keepalive_task: Mutex<Option<ScheduledTask>>,
    enable_task: Mutex<Option<ScheduledTask>>,

    /// Whether the cluster should be enabled whenever possible.
    want_enabled: AtomicBool,

    /// Set once the agent is stopped for good.
    stopping: AtomicBool,

    retry_times: AtomicU32,
    failed_keepalive: AtomicU32,

    group: TaskGroup,
}

#[derive(Debug, Deserialize)]
struct IssuedCert {
    cert: String,
    key: String,
}

impl ClusterAgent {
    pub fn new(
        id: String,
        secret: String,
        display_name: Option<String>,
        context: AgentContext,
        tokens: Arc<TokenManager>,
        status_log: Arc<ClusterStatusLog>,
        group: TaskGroup,
    ) -> Self {
        Self {
            id,
            secret,
            display_name,
            context,
            tokens,
            counters: Arc::new(Counters::new()),
            status_log,
            state: watch::Sender::new(ClusterState::Disconnected),
            channel: Mutex::new(None),
            keepalive_lock: CustomLock::new(true),
            keepalive_task: Mutex::new(None),
            enable_task: Mutex::new(None),
            want_enabled: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            retry_times: AtomicU32::new(0),
            failed_keepalive: AtomicU32::new(0),
            group,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn state(&self) -> ClusterState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClusterState> {
        self.state.subscribe()
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times.load(Ordering::SeqCst)
    }

    pub fn status_log(&self) -> &Arc<ClusterStatusLog> {
        &self.status_log
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Opens the control channel.
    pub async fn connect(self: &Arc<Self>) -> NodeResult<()> {
        if self.current_channel().is_some() {
            return Ok(());
        }

        self.set_state(ClusterState::Connecting);

        let token = self.tokens.get_token().await;
        let connection = match self.context.connector.connect(&token).await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ClusterState::Disconnected);
                return Err(e);
            }
        };

        *self.lock_channel() = Some(connection.channel);
        self.set_state(ClusterState::Connected);
        tracing::info!(cluster = %self.id, "Connected to the control plane");

        self.group.spawn(self.clone().event_loop(connection.events));

        Ok(())
    }

    /// Keeps trying to connect until it succeeds or the agent stops.
    pub async fn connect_with_retry(self: &Arc<Self>) {
        let mut delay = RECONNECT_MIN;

        while !self.is_stopping() {
            match self.connect().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        cluster = %self.id,
                        "Failed to connect, retrying in {}: {}",
                        humantime::format_duration(delay),
                        e
                    );
                    time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    /// Asks the control plane to start routing requests to this cluster.
    ///
    /// On failure, another attempt is scheduled.
    pub async fn enable(self: &Arc<Self>) -> NodeResult<()> {
        self.want_enabled.store(true, Ordering::SeqCst);
        self.cancel_enable_task();

        match self.state() {
            ClusterState::Enabled | ClusterState::WantEnable => return Ok(()),
            ClusterState::Connected => {}
            _ => return Err(NodeError::Disconnected),
        }

        if !self.context.storages.is_any_online() {
            tracing::warn!(cluster = %self.id, "Not enabling, no storage is online");
            return Err(NodeError::NoOnlineStorage);
        }

        let config = &self.context.config;
        let wait = self
            .status_log
            .enable_wait(
                Utc::now(),
                config.cluster_up_failed_interval,
                config.cluster_up_failed_times,
            )
            .await;
        if !wait.is_zero() {
            tracing::warn!(
                cluster = %self.id,
                "Failed to enable too often, waiting {}",
                humantime::format_duration(wait)
            );
            time::sleep(wait).await;
        }

        let _permit = match &self.context.enable_permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| NodeError::InternalServerError)?,
            ),
            None => None,
        };

        // The state may have changed while waiting
        if self.state() != ClusterState::Connected || self.is_stopping() {
            return Err(NodeError::Disconnected);
        }

        if !self.context.storages.is_any_online() {
            tracing::warn!(cluster = %self.id, "Not enabling, storage went offline while waiting");
            return Err(NodeError::NoOnlineStorage);
        }

        self.set_state(ClusterState::WantEnable);
        let payload = self.enable_payload();
        tracing::info!(cluster = %self.id, "Enabling");

        match self
            .emit("enable", Some(payload), config.enable_timeout)
            .await
        {
            Ok(_) if self.state() != ClusterState::WantEnable || self.is_stopping() => {
                // Disabled while the acknowledgement was in flight
                tracing::info!(cluster = %self.id, "Enable acknowledged after the cluster was disabled");
                Ok(())
            }
            Ok(_) => {
                self.set_state(ClusterState::Enabled);
                self.retry_times.store(0, Ordering::SeqCst);
                self.failed_keepalive.store(0, Ordering::SeqCst);
                self.keepalive_lock.release();
                self.start_keepalive();

                tracing::info!(cluster = %self.id, "Enabled, serving as {}", self.display_name());
                Ok(())
            }
            Err(e) => {
                if self.state() == ClusterState::WantEnable {
                    self.set_state(ClusterState::Connected);
                }

                let retry_times = self.retry_times.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(e) = self
                    .status_log
                    .record_enable_failure(Utc::now(), &e.to_string())
                    .await
                {
                    tracing::warn!(cluster = %self.id, "Failed to record enable failure: {}", e);
                }

                let delay = enable_retry_delay(retry_times);
                tracing::error!(
                    cluster = %self.id,
                    "Failed to enable, retrying in {}: {}",
                    humantime::format_duration(delay),
                    e
                );
                self.schedule_enable(delay);

                Err(e)
            }
        }
    }

    /// Asks the control plane to stop routing requests to this cluster.
    pub async fn disable(self: &Arc<Self>) -> NodeResult<()> {
        self.keepalive_lock.acquire();
        self.stop_keepalive();

        match self.state() {
            ClusterState::Enabled | ClusterState::WantEnable => {}
            _ => return Ok(()),
        }

        self.set_state(ClusterState::Disabling);
        tracing::info!(cluster = %self.id, "Disabling");

        let result = self.emit("disable", None, ACK_TIMEOUT).await;

        if self.current_channel().is_some() {
            self.set_state(ClusterState::Connected);
        } else {
            self.set_state(ClusterState::Disconnected);
        }

        match result {
            Ok(_) => {
                tracing::info!(cluster = %self.id, "Disabled");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(cluster = %self.id, "Failed to disable cleanly: {}", e);
                Err(e)
            }
        }
    }

    /// Disables the cluster until [`resume`](Self::resume) is called.
    pub async fn suspend(self: &Arc<Self>) -> NodeResult<()> {
        self.cancel_enable_task();
        self.disable().await
    }

    /// Schedules an immediate `enable` if the cluster should be enabled.
    ///
    /// A [`suspend`](Self::suspend) before the attempt starts cancels it.
    pub fn resume(self: &Arc<Self>) {
        if !self.want_enabled.load(Ordering::SeqCst) || self.is_stopping() {
            return;
        }

        self.schedule_enable(Duration::ZERO);
    }

    /// Reports the counters of the current window.
    ///
    /// Returns whether the control plane accepted the report.
    pub async fn keep_alive(self: &Arc<Self>) -> bool {
        if self.keepalive_lock.is_locked() || self.state() != ClusterState::Enabled {
            return false;
        }

        let config = &self.context.config;
        let snapshot = self.counters.snapshot();
        let now = Utc::now();
        let payload = json!({
            "time": now.timestamp_millis(),
            "hits": snapshot.hits,
            "bytes": snapshot.bytes,
        });

        let result = self
            .emit("keep-alive", Some(payload), config.keepalive.timeout)
            .await;

        match result {
            Ok(Value::Null) => self.keepalive_failed("the control plane refused the keep-alive"),
            Ok(server_time) => {
                self.failed_keepalive.store(0, Ordering::SeqCst);
                self.counters.subtract(&snapshot);
                self.persist_counters(now, &snapshot).await;

                let delay = server_time
                    .as_str()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_milliseconds());
                tracing::info!(
                    cluster = %self.id,
                    hits = snapshot.hits,
                    bytes = snapshot.bytes,
                    delay_ms = delay,
                    "Keep-alive accepted"
                );
                true
            }
            Err(e) => self.keepalive_failed(&e.to_string()),
        }
    }

    /// Requests a certificate from the control plane and writes it to disk.
    pub async fn request_cert(self: &Arc<Self>) -> NodeResult<CertPaths> {
        let value = self.emit("request-cert", None, ACK_TIMEOUT).await?;
        let issued: IssuedCert = serde_json::from_value(value).map_err(NodeError::request_error)?;

        let paths = write_cert_pair(
            &self.context.config.cert.dir,
            &self.id,
            &issued.cert,
            &issued.key,
        )
        .await?;

        tracing::info!(cluster = %self.id, "Saved issued certificate to {}", paths.cert.display());
        Ok(paths)
    }

    /// Disables the cluster and closes its channel.
    pub async fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel_enable_task();

        if let Err(e) = self.disable().await {
            tracing::debug!(cluster = %self.id, "Disable during shutdown failed: {}", e);
        }

        let channel = self.lock_channel().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        self.set_state(ClusterState::Disconnected);
        self.group.shutdown().await;
    }

    fn keepalive_failed(self: &Arc<Self>, reason: &str) -> bool {
        let max_failures = self.context.config.keepalive.max_failures;
        let failures = self.failed_keepalive.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::warn!(
            cluster = %self.id,
            "Keep-alive failed ({}/{}): {}",
            failures,
            max_failures,
            reason
        );

        if failures >= max_failures {
            self.failed_keepalive.store(0, Ordering::SeqCst);
            self.group.spawn(self.clone().kicked());
        }

        false
    }

    /// Handles repeated keep-alive failures.
    fn kicked(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tracing::error!(cluster = %self.id, "{}", NodeError::Kicked);
            self.status_log
                .record(EntryKind::Kicked, "keep-alive", Value::Null)
                .await;

            let _ = self.disable().await;

            let retry_times = self.retry_times.fetch_add(1, Ordering::SeqCst) + 1;
            self.schedule_enable(enable_retry_delay(retry_times));
        })
    }

    async fn persist_counters(&self, now: DateTime<Utc>, snapshot: &CounterSnapshot) {
        if snapshot.is_empty() {
            return;
        }

        if let Err(e) = self
            .context
            .counter_store
            .add_counters(&self.id, hour_of(now), snapshot.hits, snapshot.bytes)
            .await
        {
            tracing::warn!(cluster = %self.id, "Failed to persist counters: {}", e);
        }
    }

    /// Emits an event and records the exchange in the status log.
    async fn emit(
        &self,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> NodeResult<Value> {
        let channel = self.current_channel().ok_or(NodeError::Disconnected)?;

        self.status_log
            .record(
                EntryKind::ClientEmit,
                event,
                payload.clone().unwrap_or(Value::Null),
            )
            .await;

        let result = channel.emit(event, payload, timeout).await;

        let ack = match &result {
            Ok(value) => json!([Value::Null, value]),
            Err(e) => json!([e.to_string()]),
        };
        self.status_log.record(EntryKind::ServerAck, event, ack).await;

        result
    }

    fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Event { name, args } => {
                        let data = Value::Array(args);
                        match name.as_str() {
                            "message" => {
                                tracing::info!(cluster = %self.id, "Message from the control plane: {}", data)
                            }
                            "warden-error" => {
                                tracing::warn!(cluster = %self.id, "Warden error: {}", data)
                            }
                            "exception" => {
                                tracing::error!(cluster = %self.id, "Control plane exception: {}", data)
                            }
                            _ => tracing::debug!(cluster = %self.id, "Unhandled event {}: {}", name, data),
                        }
                        self.status_log.record(EntryKind::ServerPush, &name, data).await;
                    }
                    ChannelEvent::Disconnected { reason } => {
                        self.on_disconnect(&reason).await;
                        break;
                    }
                }
            }
        })
    }

    async fn on_disconnect(self: &Arc<Self>, reason: &str) {
        self.keepalive_lock.acquire();
        self.stop_keepalive();
        self.lock_channel().take();

        if self.is_stopping() {
            self.set_state(ClusterState::Disconnected);
            return;
        }

        tracing::warn!(cluster = %self.id, "Disconnected from the control plane: {}", reason);
        self.set_state(ClusterState::Connecting);
        self.group.spawn(self.clone().reconnect());
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            time::sleep(RECONNECT_MIN).await;
            self.connect_with_retry().await;
            self.resume();
        })
    }

    fn start_keepalive(self: &Arc<Self>) {
        let agent = Arc::downgrade(self);
        let task = self
            .group
            .schedule_repeat(self.context.config.keepalive.interval, move || {
                let agent = agent.clone();
                async move {
                    if let Some(agent) = agent.upgrade() {
                        agent.keep_alive().await;
                    }
                }
            });

        if let Some(old) = lock(&self.keepalive_task).replace(task) {
            old.cancel();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(task) = lock(&self.keepalive_task).take() {
            task.cancel();
        }
    }

    fn schedule_enable(self: &Arc<Self>, delay: Duration) {
        if self.is_stopping() {
            return;
        }

        let agent = self.clone();
        let task = self
            .group
            .schedule_once(delay, move || agent.enable_later());

        if let Some(old) = lock(&self.enable_task).replace(task) {
            old.cancel();
        }
    }

    fn enable_later(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // `enable` replaces the handle of this very task
            lock(&self.enable_task).take();

            if let Err(e) = self.enable().await {
                tracing::debug!(cluster = %self.id, "Scheduled enable failed: {}", e);
            }
        })
    }

    fn cancel_enable_task(&self) {
        if let Some(task) = lock(&self.enable_task).take() {
            task.cancel();
        }
    }

    fn enable_payload(&self) -> Value {
        let config = &self.context.config;
        let mut kinds: Vec<String> = self
            .context
            .storages
            .storages()
            .iter()
            .map(|storage| storage.kind().to_string())
            .collect();
        kinds.sort();
        kinds.dedup();

        json!({
            "host": config.advanced.host,
            "port": config.public_port(),
            "version": PROTOCOL_VERSION,
            "byoc": config.advanced.byoc,
            "noFastEnable": false,
            "flavor": {
                "runtime": concat!("Rust/bmcl-node-", env!("CARGO_PKG_VERSION")),
                "storage": kinds.join("+"),
            },
        })
    }

    fn set_state(&self, state: ClusterState) {
        let old = self.state.send_replace(state);
        if old != state {
            tracing::debug!(cluster = %self.id, "{} -> {}", old, state);
        }
    }

    fn current_channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.lock_channel().clone()
    }

    fn lock_channel(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ControlChannel>>> {
        lock(&self.channel)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Returns the delay before the next `enable` after `retry_times` failures.
pub fn enable_retry_delay(retry_times: u32) -> Duration {
    (ENABLE_RETRY_STEP * retry_times).min(ENABLE_RETRY_MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
