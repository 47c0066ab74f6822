#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod api;
pub mod audit;
pub mod cache;
pub mod cert;
pub mod cluster;
pub mod config;
pub mod control;
pub mod database;
pub mod error;
pub mod event;
pub mod lock;
pub mod socketio;
pub mod storage;
pub mod sync;
pub mod task;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use api::{ApiState, SigningKey};
use cache::FileCache;
use cert::{CertPaths, CertStore};
use cluster::ClusterManager;
use config::Config;
use control::{build_http_client, parse_base_url, ControlPlane, TokenManager};
use database::SqlCounterStore;
use event::EventBus;
use socketio::WebSocketConnector;
use storage::StorageManager;
use sync::SyncEngine;
use task::TaskGroup;

/// Components shared by every run mode that talks to the control plane.
struct Core {
    config: Arc<Config>,
    group: TaskGroup,
    events: EventBus,
    storages: Arc<StorageManager>,
    tokens: Vec<Arc<TokenManager>>,
    sync: Arc<SyncEngine>,
}

impl Core {
    /// Brings storages and tokens up.
    async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let group = TaskGroup::new();
        let events = EventBus::new();

        let storages = Arc::new(StorageManager::from_config(&config, events.clone()).await?);
        storages.setup(&group).await;

        let endpoint = parse_base_url(&config.advanced.base_url)?;
        let client = build_http_client()?;

        let tokens: Vec<_> = config
            .clusters
            .iter()
            .map(|cluster| {
                Arc::new(TokenManager::new(
                    cluster.id.clone(),
                    cluster.secret.clone(),
                    endpoint.clone(),
                    client.clone(),
                ))
            })
            .collect();

        for manager in &tokens {
            manager.setup(&group);
        }

        let planes = tokens
            .iter()
            .map(|tokens| ControlPlane::new(endpoint.clone(), client.clone(), tokens.clone()))
            .collect();
        let sync = Arc::new(SyncEngine::new(config.clone(), planes, storages.clone()));

        Ok(Self {
            config,
            group,
            events,
            storages,
            tokens,
            sync,
        })
    }

    /// Runs the first sync once a storage is online.
    async fn initial_sync(&self) {
        if !self.storages.is_any_online() {
            tracing::warn!("No storage is online yet, waiting");
        }
        self.storages.wait_online().await;

        match self.sync.sync().await {
            Ok(progress) => {
                tracing::info!(
                    "Initial sync finished: {} of {} files, {} failed",
                    progress.success,
                    progress.total,
                    progress.failed
                );
            }
            Err(e) => {
                tracing::error!("Initial sync failed: {}", e);
            }
        }
    }
}

/// Runs the node until interrupted.
pub async fn run_node(config: Config) -> Result<()> {
    let counter_store = Arc::new(connect_counter_store(&config).await?);

    let core = Core::new(config).await?;
    let config = core.config.clone();

    core.initial_sync().await;
    let _sync_task = core.sync.setup(&core.group);

    let connector = Arc::new(WebSocketConnector::new(&parse_base_url(
        &config.advanced.base_url,
    )?)?);
    let manager = Arc::new(
        ClusterManager::from_config(
            config.clone(),
            core.tokens.clone(),
            connector,
            core.storages.clone(),
            counter_store,
            core.events.clone(),
            &core.group,
        )
        .await?,
    );

    let file_cache = Arc::new(FileCache::new(
        config.file_cache.max_size,
        config.file_cache.idle,
    ));
    file_cache.spawn_pruner(&core.group);

    let keys = manager.agents().iter().map(|agent| SigningKey::from_agent(agent)).collect();
    let state = ApiState::new(
        keys,
        core.storages.clone(),
        core.sync.clone(),
        file_cache,
        config.skip_sign,
    );

    let certs = CertStore::new(existing_cert(&config).await);
    let addr = SocketAddr::new(config.web.listen, config.web.port);
    let server = tokio::spawn(cert::serve(
        addr,
        api::get_router(state),
        certs.clone(),
        core.group.child(),
    ));

    if config.cert.cert.is_none() && !config.advanced.byoc {
        for agent in manager.agents() {
            agent.connect_with_retry().await;
        }

        if manager.request_cert(&certs).await.is_none() && certs.current().is_none() {
            tracing::warn!("No certificate is available, serving plain HTTP");
        }
    }

    let runner = manager.clone();
    tokio::spawn(async move { runner.start().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    manager.stop().await;
    core.group.shutdown().await;

    server.await??;

    Ok(())
}

/// Runs a single sync then exits.
pub async fn run_sync_once(config: Config) -> Result<()> {
    let core = Core::new(config).await?;

    core.storages.wait_online().await;
    let progress = core.sync.sync().await?;
    core.group.shutdown().await;

    if progress.failed > 0 {
        return Err(anyhow!(
            "{} of {} files failed to sync",
            progress.failed,
            progress.total
        ));
    }

    tracing::info!(
        "Synchronized {} files ({} bytes)",
        progress.success,
        progress.bytes
    );

    Ok(())
}

/// Runs database migrations.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    connect_counter_store(&config).await?;

    Ok(())
}

/// Connects to the counter store and brings its schema up to date.
async fn connect_counter_store(config: &Config) -> Result<SqlCounterStore> {
    let store = SqlCounterStore::connect(&config.database_url()?).await?;
    store.migrate().await?;

    Ok(store)
}

/// Returns certificate material available at start-up.
///
/// A configured pair takes precedence over pairs issued earlier.
async fn existing_cert(config: &Config) -> Option<CertPaths> {
    if let (Some(cert), Some(key)) = (&config.cert.cert, &config.cert.key) {
        return Some(CertPaths {
            cert: cert.clone(),
            key: key.clone(),
        });
    }

    for cluster in &config.clusters {
        let paths = CertPaths::for_cluster(&config.cert.dir, &cluster.id);
        if paths.exists().await {
            return Some(paths);
        }
    }

    None
}
