//! File storage.
//!
//! A [`StorageBackend`] implements the primitive operations of one kind
//! of storage. A [`Storage`] wraps a backend with the state the node
//! tracks for it: identity, weight, health and the common helpers that
//! are built on top of the primitives.

mod alist;
mod local;
mod manager;
mod s3;
mod webdav;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::config::{BackendConfig, ServePolicy, StorageConfig};
use crate::error::{NodeError, NodeResult};
use crate::event::{EventBus, NodeEvent};
use crate::task::TaskGroup;
use bmcl::file::{download_path, shard_name, DOWNLOAD_PREFIX};

pub use self::alist::{AlistBackend, AlistStorageConfig};
pub use self::local::{LocalBackend, LocalStorageConfig};
pub use self::manager::StorageManager;
pub use self::s3::{S3Backend, S3StorageConfig};
pub use self::webdav::{WebdavBackend, WebdavStorageConfig};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Measure files kept in every writable storage.
const MEASURE_SIZES: &[u64] = &[1, 10];

/// Time between two health probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Time between two measure file checks.
const MEASURE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Name of the health probe file.
const PROBE_FILE: &str = ".py_check";

/// The kind of a storage.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// local
    Local,

    /// webdav
    Webdav,

    /// alist
    Alist,

    /// s3
    S3,

    /// minio
    Minio,
}

/// A file found by listing a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Name of the file, which is its hash.
    pub name: String,

    /// Size of the file in bytes.
    pub size: u64,

    /// Path of the file relative to the storage root.
    pub path: String,
}

/// How to serve a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFile {
    /// A file on the local filesystem.
    LocalPath(PathBuf, u64),

    /// A URL the client is redirected to.
    RemoteRedirect(String, u64),

    /// The file body.
    Memory(Bytes),

    /// The file does not exist.
    NotFound,
}

impl ResponseFile {
    /// Returns the size of the file being served.
    pub fn size(&self) -> u64 {
        match self {
            Self::LocalPath(_, size) => *size,
            Self::RemoteRedirect(_, size) => *size,
            Self::Memory(data) => data.len() as u64,
            Self::NotFound => 0,
        }
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// A storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StorageKind;

    /// Starts background maintenance of the backend.
    fn setup(&self, _group: &TaskGroup) {}

    /// Lists one shard of the download tree.
    ///
    /// A shard that does not exist is empty.
    async fn list_files(&self, shard: u8) -> NodeResult<Vec<FileInfo>>;

    /// Uploads a local file, which must be `size` bytes long.
    async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()>;

    /// Writes a small file from memory.
    async fn put_bytes(&self, path: &str, data: Bytes) -> NodeResult<()>;

    /// Deletes a file.
    async fn delete(&self, path: &str) -> NodeResult<()>;

    /// Resolves how a file is served.
    async fn get_file(&self, path: &str) -> NodeResult<ResponseFile>;

    /// Returns the size of a file, or `None` if it does not exist.
    async fn get_size(&self, path: &str) -> NodeResult<Option<u64>>;
}

/// A configured storage.
#[derive(Debug)]
pub struct Storage {
    id: String,
    weight: i32,
    readonly: bool,
    online: AtomicBool,
    list_concurrent: usize,
    backend: Box<dyn StorageBackend>,
}

impl Storage {
    pub fn new(
        id: String,
        weight: i32,
        readonly: bool,
        list_concurrent: usize,
        backend: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            id,
            weight,
            readonly,
            online: AtomicBool::new(false),
            list_concurrent: list_concurrent.max(1),
            backend,
        }
    }

    /// Instantiates the backend declared at `index`.
    pub async fn from_config(
        index: usize,
        config: &StorageConfig,
        list_concurrent: usize,
    ) -> NodeResult<Self> {
        let id = config.id(index);
        let serve = config.serve;

        let backend: Box<dyn StorageBackend> = match &config.backend {
            BackendConfig::Local(local) => Box::new(LocalBackend::new(local.clone()).await?),
            BackendConfig::Webdav(webdav) => Box::new(WebdavBackend::new(
                webdav.clone(),
                serve,
                config.cache_size,
                config.cache_ttl,
            )?),
            BackendConfig::Alist(alist) => Box::new(AlistBackend::new(
                alist.clone(),
                config.cache_size,
                config.cache_ttl,
            )?),
            BackendConfig::S3(s3) => {
                Box::new(S3Backend::new(s3.clone(), StorageKind::S3, serve, config.cache_ttl).await?)
            }
            BackendConfig::Minio(s3) => Box::new(
                S3Backend::new(s3.clone(), StorageKind::Minio, serve, config.cache_ttl).await?,
            ),
        };

        if serve == ServePolicy::Proxy && config.kind() == StorageKind::Local {
            tracing::warn!("Storage {} is local; serve policy has no effect", id);
        }

        Ok(Self::new(
            id,
            config.weight,
            config.readonly,
            list_concurrent,
            backend,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Sets the health status, returning whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst) != online
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Resolves how the file with `hash` is served.
    pub async fn get_response_file(&self, hash: &str) -> NodeResult<ResponseFile> {
        self.backend.get_file(&download_path(hash)).await
    }

    pub async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()> {
        if self.readonly {
            return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                "Storage {} is read-only",
                self.id
            )));
        }

        self.backend.upload(path, source, size).await
    }

    /// Lists the whole download tree, keyed by hash.
    ///
    /// Shards are listed concurrently, at most `list_concurrent` at a time.
    pub async fn list_download_files(&self) -> NodeResult<HashMap<String, FileInfo>> {
        let shards: Vec<Vec<FileInfo>> = stream::iter(0..=u8::MAX)
            .map(|shard| self.backend.list_files(shard))
            .buffer_unordered(self.list_concurrent)
            .try_collect()
            .await?;

        let files = shards
            .into_iter()
            .flatten()
            .map(|info| (info.name.clone(), info))
            .collect();

        Ok(files)
    }

    /// Returns whether `measure/{size}` exists with the expected size.
    pub async fn check_measure(&self, size: u64) -> NodeResult<bool> {
        let actual = self.backend.get_size(&measure_path(size)).await?;
        Ok(actual == Some(size * MIB))
    }

    /// Writes `size` MiB of zeros to `measure/{size}`.
    pub async fn write_measure(&self, size: u64) -> NodeResult<()> {
        let data = Bytes::from(vec![0u8; (size * MIB) as usize]);
        self.backend.put_bytes(&measure_path(size), data).await
    }

    /// Writes and deletes a probe file.
    pub async fn probe(&self) -> NodeResult<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        self.backend
            .put_bytes(PROBE_FILE, Bytes::from(nanos.to_string()))
            .await?;
        self.backend.delete(PROBE_FILE).await?;

        Ok(())
    }

    /// Probes the storage and publishes status transitions.
    pub async fn check_health(&self, events: &EventBus) -> bool {
        let online = match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Storage {} failed its health probe: {}", self.id, e);
                false
            }
        };

        if self.set_online(online) {
            if online {
                tracing::info!("Storage {} is online", self.id);
            } else {
                tracing::warn!("Storage {} is offline", self.id);
            }

            events.emit(NodeEvent::StorageStatus {
                id: self.id.clone(),
                online,
            });
        }

        online
    }

    /// Makes sure the measure files exist.
    pub async fn ensure_measure_files(&self) -> NodeResult<()> {
        if self.readonly {
            return Ok(());
        }

        for &size in MEASURE_SIZES {
            if !self.check_measure(size).await? {
                tracing::info!("Writing {} MiB measure file to storage {}", size, self.id);
                self.write_measure(size).await?;
            }
        }

        Ok(())
    }

    /// Starts the health probe loop and the measure file self-check.
    pub async fn setup(self: &Arc<Self>, group: &TaskGroup, events: &EventBus) {
        self.backend.setup(group);
        self.check_health(events).await;

        if let Err(e) = self.ensure_measure_files().await {
            tracing::warn!("Failed to check measure files of storage {}: {}", self.id, e);
        }

        group.schedule_repeat(PROBE_INTERVAL, {
            let storage = self.clone();
            let events = events.clone();
            move || {
                let storage = storage.clone();
                let events = events.clone();
                async move {
                    storage.check_health(&events).await;
                }
            }
        });

        group.schedule_repeat(MEASURE_CHECK_INTERVAL, {
            let storage = self.clone();
            move || {
                let storage = storage.clone();
                async move {
                    if let Err(e) = storage.ensure_measure_files().await {
                        tracing::warn!(
                            "Failed to check measure files of storage {}: {}",
                            storage.id,
                            e
                        );
                    }
                }
            }
        });
    }
}

/// Returns the path of a measure file.
pub fn measure_path(size: u64) -> String {
    format!("measure/{}", size)
}

/// Returns the directory of a shard.
pub(crate) fn shard_dir(shard: u8) -> String {
    format!("{}/{}", DOWNLOAD_PREFIX, shard_name(shard))
}

/// Joins a storage root and a relative path with exactly one slash.
pub(crate) fn join_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');

    if root.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", root, path)
    }
}
