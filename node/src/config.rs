//! Node configuration.

use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::storage::{
    AlistStorageConfig, LocalStorageConfig, S3StorageConfig, StorageKind, WebdavStorageConfig,
};

/// Application prefix in XDG base directories.
///
/// This will be concatenated into `$XDG_CONFIG_HOME/bmcl`.
const XDG_PREFIX: &str = "bmcl";

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to container platforms.
const ENV_CONFIG_BASE64: &str = "BMCL_NODE_CONFIG_BASE64";

/// The canonical control plane.
const DEFAULT_BASE_URL: &str = "https://openbmclapi.bangbang93.com";

/// Configuration for the node.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster identities hosted by this node.
    pub clusters: Vec<ClusterConfig>,

    /// Storage backends.
    #[serde(default = "Vec::new")]
    pub storages: Vec<StorageConfig>,

    /// HTTP listener.
    #[serde(default = "Default::default")]
    pub web: WebConfig,

    /// TLS certificate material.
    #[serde(default = "Default::default")]
    pub cert: CertConfig,

    /// Advertised endpoint and control plane.
    #[serde(default = "Default::default")]
    pub advanced: AdvancedConfig,

    /// File synchronization.
    #[serde(default = "Default::default")]
    pub sync: SyncConfig,

    /// Keep-alive reporting.
    #[serde(default = "Default::default")]
    pub keepalive: KeepaliveConfig,

    /// How long to wait for the control plane to acknowledge `enable`.
    #[serde(with = "humantime_serde", default = "default_enable_timeout")]
    pub enable_timeout: Duration,

    /// The sliding window of the enable failure budget.
    #[serde(with = "humantime_serde", default = "default_cluster_up_failed_interval")]
    pub cluster_up_failed_interval: Duration,

    /// Number of enable failures tolerated inside the window.
    #[serde(default = "default_cluster_up_failed_times")]
    pub cluster_up_failed_times: usize,

    /// Directory of the per-cluster status logs.
    #[serde(default = "default_cluster_status_dir")]
    pub cluster_status_dir: PathBuf,

    /// How long status log entries are kept.
    #[serde(with = "humantime_serde", default = "default_cluster_status_retention")]
    pub cluster_status_retention: Duration,

    /// Whether clusters may send `enable` concurrently.
    ///
    /// If false, `enable` calls are serialized across all clusters.
    #[serde(default = "default_concurrency_enable_cluster")]
    pub concurrency_enable_cluster: bool,

    /// Skip download signature verification.
    ///
    /// Only use this for local testing.
    #[serde(default)]
    pub skip_sign: bool,

    /// Counter store.
    #[serde(default = "Default::default")]
    pub database: DatabaseConfig,

    /// In-memory cache of small remote files.
    #[serde(default = "Default::default")]
    pub file_cache: FileCacheConfig,
}

/// A cluster identity.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// The cluster ID issued by the control plane.
    pub id: String,

    /// The cluster secret.
    #[derivative(Debug = "ignore")]
    pub secret: String,

    /// A human-readable name used in logs.
    pub display_name: Option<String>,
}

/// A storage backend declaration.
#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    /// Unique ID of the backend.
    ///
    /// Defaults to `{type}-{index}`.
    pub id: Option<String>,

    /// Selection weight.
    ///
    /// Negative weights are only used as a fallback.
    #[serde(default = "default_storage_weight")]
    pub weight: i32,

    /// Whether the backend is never written to.
    #[serde(default)]
    pub readonly: bool,

    /// How files in remote backends are served.
    #[serde(default = "Default::default")]
    pub serve: ServePolicy,

    /// Maximum number of cached lookups.
    ///
    /// Unbounded if unset.
    pub cache_size: Option<usize>,

    /// Lifetime of cached lookups.
    #[serde(with = "humantime_serde", default = "default_storage_cache_ttl")]
    pub cache_ttl: Duration,

    /// Backend-specific configuration.
    #[serde(flatten)]
    pub backend: BackendConfig,
}

/// Backend-specific storage configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    /// Local file storage.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),

    /// WebDAV storage.
    #[serde(rename = "webdav")]
    Webdav(WebdavStorageConfig),

    /// Alist storage.
    #[serde(rename = "alist")]
    Alist(AlistStorageConfig),

    /// S3 storage.
    #[serde(rename = "s3")]
    S3(S3StorageConfig),

    /// MinIO storage.
    #[serde(rename = "minio")]
    Minio(S3StorageConfig),
}

/// How files in remote backends are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ServePolicy {
    /// Redirect clients to the backend.
    #[default]
    #[serde(rename = "redirect")]
    Redirect,

    /// Fetch the file and serve it from the node.
    #[serde(rename = "proxy")]
    Proxy,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port advertised to the control plane.
    ///
    /// Defaults to `port`.
    pub public_port: Option<u16>,
}

/// Certificate configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertConfig {
    /// Directory of certificates issued by the control plane.
    #[serde(default = "default_cert_dir")]
    pub dir: PathBuf,

    /// Path to a user-supplied certificate chain.
    pub cert: Option<PathBuf>,

    /// Path to a user-supplied private key.
    pub key: Option<PathBuf>,
}

/// Advanced configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvancedConfig {
    /// Host advertised to the control plane.
    ///
    /// If unset, the control plane uses the address the node connects from.
    pub host: Option<String>,

    /// Base URL of the control plane.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Whether the node brings its own certificate.
    #[serde(default)]
    pub byoc: bool,
}

/// Sync configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Time between two sync runs.
    #[serde(with = "humantime_serde", default = "default_sync_interval")]
    pub interval: Duration,

    /// Number of shards listed concurrently per backend.
    #[serde(default = "default_list_concurrent")]
    pub list_concurrent: usize,

    /// Directory for temporary download files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Download attempts per file.
    #[serde(default = "default_retries")]
    pub download_retries: usize,

    /// Delay between two download attempts.
    #[serde(with = "humantime_serde", default = "default_download_retry_delay")]
    pub download_retry_delay: Duration,

    /// Longest wait for the next chunk of a download.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Upload attempts per file and backend.
    #[serde(default = "default_retries")]
    pub upload_retries: usize,

    /// Base of the linear upload backoff.
    ///
    /// The n-th retry waits `n * upload_retry_delay`.
    #[serde(with = "humantime_serde", default = "default_upload_retry_delay")]
    pub upload_retry_delay: Duration,

    /// Worker count used when the control plane does not say.
    #[serde(default = "default_sync_concurrency")]
    pub default_concurrency: usize,
}

/// Keep-alive configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepaliveConfig {
    /// Time between two keep-alives.
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub interval: Duration,

    /// How long to wait for a keep-alive ack.
    #[serde(with = "humantime_serde", default = "default_keepalive_timeout")]
    pub timeout: Duration,

    /// Consecutive failures before the cluster is considered kicked.
    #[serde(default = "default_keepalive_max_failures")]
    pub max_failures: u32,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL.
    ///
    /// Defaults to a SQLite database in the XDG data directory.
    pub url: Option<String>,
}

/// File cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileCacheConfig {
    /// Total size of cached bodies in bytes.
    #[serde(default = "default_file_cache_size")]
    pub max_size: u64,

    /// Entries idle for longer than this are dropped.
    #[serde(with = "humantime_serde", default = "default_file_cache_idle")]
    pub idle: Duration,
}

impl Config {
    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(anyhow!("At least one cluster must be configured"));
        }

        let mut cluster_ids = HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.is_empty() || cluster.secret.is_empty() {
                return Err(anyhow!("Cluster IDs and secrets must not be empty"));
            }
            if !cluster_ids.insert(cluster.id.as_str()) {
                return Err(anyhow!("Duplicate cluster ID {}", cluster.id));
            }
        }

        if self.storages.is_empty() {
            return Err(anyhow!("At least one storage must be configured"));
        }

        let mut storage_ids = HashSet::new();
        for (index, storage) in self.storages.iter().enumerate() {
            let id = storage.id(index);
            if !storage_ids.insert(id.clone()) {
                return Err(anyhow!("Duplicate storage ID {}", id));
            }
        }

        if self.cluster_up_failed_times == 0 {
            return Err(anyhow!("cluster_up_failed_times must be at least 1"));
        }

        Ok(())
    }

    /// Returns the port advertised to the control plane.
    pub fn public_port(&self) -> u16 {
        self.web.public_port.unwrap_or(self.web.port)
    }

    /// Returns the database URL.
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.database.url {
            return Ok(url.to_owned());
        }

        let path = get_xdg_data_path()?.join("node.db");
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("Data directory path contains non-UTF-8"))?;

        Ok(format!("sqlite://{}?mode=rwc", path))
    }
}

impl StorageConfig {
    /// Returns the ID of the backend declared at `index`.
    pub fn id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.kind(), index))
    }

    pub fn kind(&self) -> StorageKind {
        match &self.backend {
            BackendConfig::Local(_) => StorageKind::Local,
            BackendConfig::Webdav(_) => StorageKind::Webdav,
            BackendConfig::Alist(_) => StorageKind::Alist,
            BackendConfig::S3(_) => StorageKind::S3,
            BackendConfig::Minio(_) => StorageKind::Minio,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_address(),
            port: default_port(),
            public_port: None,
        }
    }
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            dir: default_cert_dir(),
            cert: None,
            key: None,
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            host: None,
            base_url: default_base_url(),
            byoc: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            list_concurrent: default_list_concurrent(),
            cache_dir: default_cache_dir(),
            download_retries: default_retries(),
            download_retry_delay: default_download_retry_delay(),
            read_timeout: default_read_timeout(),
            upload_retries: default_retries(),
            upload_retry_delay: default_upload_retry_delay(),
            default_concurrency: default_sync_concurrency(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_keepalive_interval(),
            timeout: default_keepalive_timeout(),
            max_failures: default_keepalive_max_failures(),
        }
    }
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_file_cache_size(),
            idle: default_file_cache_idle(),
        }
    }
}

fn default_listen_address() -> IpAddr {
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    4000
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(".ssl")
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_enable_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_cluster_up_failed_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_cluster_up_failed_times() -> usize {
    5
}

fn default_cluster_status_dir() -> PathBuf {
    PathBuf::from("cluster_status")
}

fn default_cluster_status_retention() -> Duration {
    Duration::from_secs(30 * 86400)
}

fn default_concurrency_enable_cluster() -> bool {
    false
}

fn default_storage_weight() -> i32 {
    1
}

fn default_storage_cache_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_list_concurrent() -> usize {
    32
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_retries() -> usize {
    10
}

fn default_download_retry_delay() -> Duration {
    Duration::from_secs(50)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_upload_retry_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_sync_concurrency() -> usize {
    10
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keepalive_max_failures() -> u32 {
    3
}

fn default_file_cache_size() -> u64 {
    512 * 1024 * 1024
}

fn default_file_cache_idle() -> Duration {
    Duration::from_secs(24 * 60)
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {:?}", path))?;
    load_config_from_str(&config)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    let config: Config = toml::from_str(s).context("Invalid configuration file")?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration in the standard order of precedence.
///
/// - The path given on the command line
/// - `BMCL_NODE_CONFIG_BASE64`
/// - `$XDG_CONFIG_HOME/bmcl/node.toml`
pub async fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        return load_config_from_path(config_path);
    }

    if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        tracing::info!("Using configurations from environment variable");
        let decoded = String::from_utf8(BASE64_STANDARD.decode(config_env.as_bytes())?)?;
        return load_config_from_str(&decoded);
    }

    let config_path = get_xdg_config_path()?;
    load_config_from_path(&config_path)
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("node.toml")?;

    Ok(config_path)
}

pub fn get_xdg_data_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let data_path = xdg_dirs.create_data_directory("")?;

    Ok(data_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[clusters]]
id = "c1"
secret = "s"

[[storages]]
type = "local"
path = "/data"
"#;

    #[test]
    fn test_minimal() {
        let config = load_config_from_str(MINIMAL).unwrap();

        assert_eq!(1, config.clusters.len());
        assert_eq!(4000, config.public_port());
        assert_eq!(Duration::from_secs(600), config.sync.interval);
        assert_eq!(Duration::from_secs(50), config.sync.download_retry_delay);
        assert_eq!(3, config.keepalive.max_failures);
        assert!(!config.concurrency_enable_cluster);
        assert!(!config.skip_sign);

        let storage = &config.storages[0];
        assert_eq!(1, storage.weight);
        assert_eq!("local-0", storage.id(0));
        assert_eq!(ServePolicy::Redirect, storage.serve);
        assert!(matches!(storage.backend, BackendConfig::Local(_)));
    }

    #[test]
    fn test_full() {
        let config = load_config_from_str(
            r#"
skip_sign = true
concurrency_enable_cluster = true
cluster_up_failed_interval = "10m"
cluster_up_failed_times = 3

[[clusters]]
id = "c1"
secret = "s1"

[[clusters]]
id = "c2"
secret = "s2"
display_name = "Second"

[[storages]]
id = "primary"
type = "alist"
endpoint = "http://127.0.0.1:5244"
username = "admin"
password = "pw"
path = "/bmcl"
weight = 10
cache_ttl = "5m"
cache_size = 1000

[[storages]]
type = "minio"
endpoint = "http://127.0.0.1:9000"
bucket = "bmcl"
access_key = "ak"
secret_key = "sk"
weight = -1
serve = "proxy"

[web]
port = 8800
public_port = 443

[advanced]
host = "node.example.com"
byoc = true

[sync]
interval = "15m"
list_concurrent = 8
"#,
        )
        .unwrap();

        assert!(config.skip_sign);
        assert!(config.concurrency_enable_cluster);
        assert_eq!(Duration::from_secs(600), config.cluster_up_failed_interval);
        assert_eq!(443, config.public_port());
        assert_eq!(Some("node.example.com"), config.advanced.host.as_deref());
        assert_eq!(Duration::from_secs(900), config.sync.interval);
        assert_eq!(8, config.sync.list_concurrent);

        assert_eq!("primary", config.storages[0].id(0));
        assert_eq!(10, config.storages[0].weight);
        assert_eq!(Some(1000), config.storages[0].cache_size);
        assert_eq!(Duration::from_secs(300), config.storages[0].cache_ttl);
        assert_eq!(StorageKind::Alist, config.storages[0].kind());

        assert_eq!("minio-1", config.storages[1].id(1));
        assert_eq!(-1, config.storages[1].weight);
        assert_eq!(ServePolicy::Proxy, config.storages[1].serve);
        assert_eq!(StorageKind::Minio, config.storages[1].kind());
    }

    #[test]
    fn test_secret_not_in_debug() {
        let config = load_config_from_str(MINIMAL).unwrap();
        let debug = format!("{:?}", config.clusters[0]);

        assert!(debug.contains("c1"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_invalid() {
        // no clusters
        assert!(load_config_from_str(
            r#"
clusters = []

[[storages]]
type = "local"
path = "/data"
"#
        )
        .is_err());

        // no storages
        assert!(load_config_from_str(
            r#"
[[clusters]]
id = "c1"
secret = "s"
"#
        )
        .is_err());

        // duplicate storage IDs
        assert!(load_config_from_str(
            r#"
[[clusters]]
id = "c1"
secret = "s"

[[storages]]
id = "a"
type = "local"
path = "/a"

[[storages]]
id = "a"
type = "local"
path = "/b"
"#
        )
        .is_err());

        // unknown key
        assert!(load_config_from_str(&format!("{}\nunknown = 1\n", MINIMAL)).is_err());
    }
}
