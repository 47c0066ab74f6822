//! Alist storage.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use super::{join_path, shard_dir, FileInfo, ResponseFile, StorageBackend, StorageKind};
use crate::cache::TtlCache;
use crate::error::{NodeError, NodeResult};
use crate::task::TaskGroup;

/// How often the session token is renewed.
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Timeout of metadata requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Status code Alist uses for an expired session.
const CODE_UNAUTHORIZED: u16 = 401;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct AlistBackend {
    session: Arc<AlistSession>,
    #[derivative(Debug = "ignore")]
    responses: Arc<TtlCache<String, ResponseFile>>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct AlistSession {
    config: AlistStorageConfig,
    #[derivative(Debug = "ignore")]
    client: Client,
    #[derivative(Debug = "ignore")]
    token: RwLock<Option<String>>,
}

#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct AlistStorageConfig {
    /// The Alist server.
    pub endpoint: String,

    pub username: String,

    #[derivative(Debug = "ignore")]
    pub password: String,

    /// The directory to store all files under.
    #[serde(default = "default_root")]
    pub path: String,
}

/// The envelope of every Alist response.
#[derive(Debug, Deserialize)]
struct AlistResponse<T> {
    code: u16,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListData {
    content: Option<Vec<AlistObject>>,
}

#[derive(Debug, Deserialize)]
struct AlistObject {
    name: String,
    size: u64,
    is_dir: bool,
    #[serde(default)]
    raw_url: String,
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    path: &'a str,
    page: u32,
    per_page: u32,
    refresh: bool,
}

fn default_root() -> String {
    "/".to_string()
}

impl<T> AlistResponse<T> {
    fn into_data(self, what: &str) -> NodeResult<T> {
        if self.code != 200 {
            return Err(NodeError::StorageError(anyhow::anyhow!(
                "{} failed with code {}: {}",
                what,
                self.code,
                self.message
            )));
        }

        self.data.ok_or_else(|| {
            NodeError::StorageError(anyhow::anyhow!("{} returned no data", what))
        })
    }

    fn is_not_found(&self) -> bool {
        let message = self.message.to_lowercase();
        message.contains("not found") || message.contains("not exist")
    }
}

impl AlistSession {
    fn url(&self, api: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), api)
    }

    fn full_path(&self, path: &str) -> String {
        join_path(&self.config.path, path)
    }

    async fn login(&self) -> NodeResult<String> {
        let response: AlistResponse<LoginData> = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(NodeError::storage_error)?
            .json()
            .await
            .map_err(NodeError::storage_error)?;

        let token = response.into_data("Login")?.token;
        *self.token.write().await = Some(token.clone());

        Ok(token)
    }

    async fn token(&self) -> NodeResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }

        self.login().await
    }

    /// Sends an authenticated request, logging in again once if the
    /// session has expired.
    async fn call<T, F>(&self, build: F) -> NodeResult<AlistResponse<T>>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut token = self.token().await?;

        for attempt in 0..2 {
            let response: AlistResponse<T> = build(&self.client)
                .header(AUTHORIZATION, &token)
                .send()
                .await
                .map_err(NodeError::storage_error)?
                .json()
                .await
                .map_err(NodeError::storage_error)?;

            if response.code == CODE_UNAUTHORIZED && attempt == 0 {
                tracing::debug!("Alist session expired, logging in again");
                token = self.login().await?;
                continue;
            }

            return Ok(response);
        }

        Err(NodeError::StorageError(anyhow::anyhow!(
            "Alist rejected a fresh session"
        )))
    }

    async fn stat(&self, path: &str) -> NodeResult<Option<AlistObject>> {
        let url = self.url("/api/fs/get");
        let full_path = self.full_path(path);

        let response: AlistResponse<AlistObject> = self
            .call(|client| {
                client
                    .post(&url)
                    .json(&json!({ "path": full_path }))
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;

        if response.code != 200 && response.is_not_found() {
            return Ok(None);
        }

        response.into_data("Stat").map(Some)
    }

    async fn put(&self, path: &str, body: impl Fn() -> Body, size: u64) -> NodeResult<()> {
        let url = self.url("/api/fs/put");
        let file_path = urlencoding::encode(&self.full_path(path)).into_owned();

        let response: AlistResponse<serde_json::Value> = self
            .call(|client| {
                client
                    .put(&url)
                    .header("File-Path", &file_path)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, size)
                    .body(body())
            })
            .await?;

        if response.code != 200 {
            return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                "Upload of {} failed with code {}: {}",
                path,
                response.code,
                response.message
            )));
        }

        Ok(())
    }
}

impl AlistBackend {
    pub fn new(
        config: AlistStorageConfig,
        cache_size: Option<usize>,
        cache_ttl: Duration,
    ) -> NodeResult<Self> {
        let client = Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NodeError::storage_error)?;

        Ok(Self {
            session: Arc::new(AlistSession {
                config,
                client,
                token: RwLock::new(None),
            }),
            responses: Arc::new(TtlCache::new(cache_size, cache_ttl)),
        })
    }
}

#[async_trait]
impl StorageBackend for AlistBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Alist
    }

    fn setup(&self, group: &TaskGroup) {
        self.responses.spawn_pruner(group);

        let session = self.session.clone();
        group.schedule_repeat(TOKEN_REFRESH_INTERVAL, move || {
            let session = session.clone();
            async move {
                if let Err(e) = session.login().await {
                    tracing::warn!("Failed to refresh Alist session: {}", e);
                }
            }
        });
    }

    async fn list_files(&self, shard: u8) -> NodeResult<Vec<FileInfo>> {
        let dir = shard_dir(shard);
        let url = self.session.url("/api/fs/list");
        let full_path = self.session.full_path(&dir);

        let response: AlistResponse<ListData> = self
            .session
            .call(|client| {
                client
                    .post(&url)
                    .json(&ListRequest {
                        path: &full_path,
                        page: 1,
                        per_page: 0,
                        refresh: false,
                    })
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;

        if response.code != 200 && response.is_not_found() {
            return Ok(Vec::new());
        }

        let files = response
            .into_data("List")?
            .content
            .unwrap_or_default()
            .into_iter()
            .filter(|object| !object.is_dir)
            .map(|object| FileInfo {
                path: format!("{}/{}", dir, object.name),
                name: object.name,
                size: object.size,
            })
            .collect();

        Ok(files)
    }

    async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()> {
        // The body is rebuilt if the session has to be renewed
        let data = tokio::fs::read(source)
            .await
            .map(Bytes::from)
            .map_err(NodeError::storage_write_error)?;

        if data.len() as u64 != size {
            return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                "Source of {} has {} bytes, expected {}",
                path,
                data.len(),
                size
            )));
        }

        self.put_bytes(path, data).await
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> NodeResult<()> {
        let size = data.len() as u64;
        self.session
            .put(path, || Body::from(data.clone()), size)
            .await?;
        self.responses.remove(&path.to_owned());

        Ok(())
    }

    async fn delete(&self, path: &str) -> NodeResult<()> {
        let url = self.session.url("/api/fs/remove");
        let full_path = self.session.full_path(path);
        let (dir, name) = full_path.rsplit_once('/').unwrap_or(("", full_path.as_str()));
        let dir = if dir.is_empty() { "/" } else { dir };

        let response: AlistResponse<serde_json::Value> = self
            .session
            .call(|client| {
                client
                    .post(&url)
                    .json(&json!({ "dir": dir, "names": [name] }))
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;

        if response.code != 200 && !response.is_not_found() {
            return Err(NodeError::StorageError(anyhow::anyhow!(
                "Removal of {} failed with code {}: {}",
                path,
                response.code,
                response.message
            )));
        }

        self.responses.remove(&path.to_owned());
        Ok(())
    }

    async fn get_file(&self, path: &str) -> NodeResult<ResponseFile> {
        let key = path.to_owned();
        if let Some(cached) = self.responses.get(&key) {
            return Ok(cached);
        }

        let file = match self.session.stat(path).await? {
            Some(object) if !object.is_dir && !object.raw_url.is_empty() => {
                ResponseFile::RemoteRedirect(object.raw_url, object.size)
            }
            _ => return Ok(ResponseFile::NotFound),
        };

        self.responses.set(key, file.clone());
        Ok(file)
    }

    async fn get_size(&self, path: &str) -> NodeResult<Option<u64>> {
        Ok(self
            .session
            .stat(path)
            .await?
            .filter(|object| !object.is_dir)
            .map(|object| object.size))
    }
}
