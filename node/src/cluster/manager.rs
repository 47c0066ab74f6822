//! All clusters of the node.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;

use super::agent::AgentContext;
use super::ClusterAgent;
use crate::audit::ClusterStatusLog;
use crate::cert::{CertPaths, CertStore};
use crate::config::Config;
use crate::control::TokenManager;
use crate::database::CounterStore;
use crate::error::NodeResult;
use crate::event::{EventBus, NodeEvent};
use crate::socketio::Connector;
use crate::storage::StorageManager;
use crate::task::TaskGroup;

/// How often status logs drop expired entries.
const STATUS_LOG_COMPACT_INTERVAL: Duration = Duration::from_secs(86400);

/// Drives the clusters of the node.
#[derive(Debug)]
pub struct ClusterManager {
    agents: Vec<Arc<ClusterAgent>>,
    events: EventBus,
    group: TaskGroup,
}

impl ClusterManager {
    pub fn new(agents: Vec<Arc<ClusterAgent>>, events: EventBus, group: TaskGroup) -> Self {
        Self {
            agents,
            events,
            group,
        }
    }

    /// Creates an agent for every configured cluster.
    ///
    /// `tokens` holds the token manager of each cluster, in configuration
    /// order.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_config(
        config: Arc<Config>,
        tokens: Vec<Arc<TokenManager>>,
        connector: Arc<dyn Connector>,
        storages: Arc<StorageManager>,
        counter_store: Arc<dyn CounterStore>,
        events: EventBus,
        group: &TaskGroup,
    ) -> NodeResult<Self> {
        let enable_permits = if config.concurrency_enable_cluster {
            None
        } else {
            Some(Arc::new(Semaphore::new(1)))
        };

        let context = AgentContext {
            config: config.clone(),
            connector,
            storages,
            counter_store,
            enable_permits,
        };

        let mut agents = Vec::with_capacity(config.clusters.len());
        for (cluster, tokens) in config.clusters.iter().zip(tokens) {
            let status_log = ClusterStatusLog::open(
                &config.cluster_status_dir,
                &cluster.id,
                config.cluster_status_retention,
                Utc::now(),
            )
            .await?;

            agents.push(Arc::new(ClusterAgent::new(
                cluster.id.clone(),
                cluster.secret.clone(),
                cluster.display_name.clone(),
                context.clone(),
                tokens,
                Arc::new(status_log),
                group.child(),
            )));
        }

        Ok(Self::new(agents, events, group.child()))
    }

    pub fn agents(&self) -> &[Arc<ClusterAgent>] {
        &self.agents
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ClusterAgent>> {
        self.agents.iter().find(|agent| agent.id() == id)
    }

    /// Connects and enables every cluster, and follows storage health
    /// from then on.
    pub async fn start(self: &Arc<Self>) {
        self.follow_storages();
        self.compact_status_logs();

        join_all(self.agents.iter().map(|agent| async move {
            agent.connect_with_retry().await;

            if let Err(e) = agent.enable().await {
                tracing::warn!(cluster = %agent.id(), "Initial enable failed: {}", e);
            }
        }))
        .await;
    }

    /// Requests a certificate through the first cluster that gets one.
    pub async fn request_cert(&self, certs: &CertStore) -> Option<CertPaths> {
        for agent in &self.agents {
            match agent.request_cert().await {
                Ok(paths) => {
                    certs.publish(paths.clone());
                    return Some(paths);
                }
                Err(e) => {
                    tracing::warn!(cluster = %agent.id(), "Failed to request certificate: {}", e);
                }
            }
        }

        None
    }

    /// Disables every cluster and closes their channels.
    pub async fn stop(&self) {
        tracing::info!("Stopping clusters");
        join_all(self.agents.iter().map(|agent| agent.stop())).await;
        self.group.shutdown().await;
    }

    /// Disables clusters when no storage is online and re-enables them
    /// afterwards.
    fn follow_storages(self: &Arc<Self>) {
        let mut events = self.events.subscribe();
        let manager = self.clone();

        self.group.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::StorageDisable) => manager.suspend_all().await,
                    Ok(NodeEvent::StorageEnable) => manager.resume_all(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} storage events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn compact_status_logs(&self) {
        let logs: Vec<_> = self
            .agents
            .iter()
            .map(|agent| agent.status_log().clone())
            .collect();

        self.group
            .schedule_repeat(STATUS_LOG_COMPACT_INTERVAL, move || {
                let logs = logs.clone();
                async move {
                    for log in logs {
                        if let Err(e) = log.compact(Utc::now()).await {
                            tracing::warn!(path = %log.path().display(), "Failed to compact status log: {}", e);
                        }
                    }
                }
            });
    }

    async fn suspend_all(&self) {
        tracing::warn!("No storage is online, disabling all clusters");

        join_all(self.agents.iter().map(|agent| async move {
            if let Err(e) = agent.suspend().await {
                tracing::warn!(cluster = %agent.id(), "Failed to disable: {}", e);
            }
        }))
        .await;
    }

    fn resume_all(&self) {
        tracing::info!("Storage is back, enabling clusters");

        for agent in &self.agents {
            agent.resume();
        }
    }
}
