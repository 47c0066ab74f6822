//! WebDAV storage.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{redirect, Body, Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use xmlparser::{ElementEnd, Token, Tokenizer};

use super::{join_path, shard_dir, FileInfo, ResponseFile, StorageBackend, StorageKind};
use crate::cache::TtlCache;
use crate::config::ServePolicy;
use crate::error::{NodeError, NodeResult};
use crate::task::TaskGroup;

/// Timeout of metadata requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<propfind xmlns="DAV:"><prop><resourcetype/><getcontentlength/></prop></propfind>"#;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebdavBackend {
    config: WebdavStorageConfig,
    serve: ServePolicy,
    endpoint: Url,
    public_endpoint: Option<Url>,
    #[derivative(Debug = "ignore")]
    client: Client,
    propfind: Method,
    mkcol: Method,
    #[derivative(Debug = "ignore")]
    created_dirs: Mutex<HashSet<String>>,
    #[derivative(Debug = "ignore")]
    responses: Arc<TtlCache<String, ResponseFile>>,
}

#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct WebdavStorageConfig {
    /// The WebDAV server.
    pub endpoint: String,

    pub username: Option<String>,

    #[derivative(Debug = "ignore")]
    pub password: Option<String>,

    /// The directory to store all files under.
    #[serde(default = "default_root")]
    pub path: String,

    /// The endpoint clients are redirected to.
    ///
    /// Credentials are embedded into redirect URLs.
    pub public_endpoint: Option<String>,
}

/// An entry of a PROPFIND response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DavEntry {
    href: String,
    size: Option<u64>,
    is_collection: bool,
}

fn default_root() -> String {
    "/".to_string()
}

impl WebdavBackend {
    pub fn new(
        config: WebdavStorageConfig,
        serve: ServePolicy,
        cache_size: Option<usize>,
        cache_ttl: Duration,
    ) -> NodeResult<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(NodeError::storage_error)?;

        let public_endpoint = match &config.public_endpoint {
            Some(public) => {
                let mut url = Url::parse(public).map_err(NodeError::storage_error)?;
                if let Some(username) = &config.username {
                    let _ = url.set_username(username);
                    let _ = url.set_password(config.password.as_deref());
                }
                Some(url)
            }
            None => None,
        };

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NodeError::storage_error)?;

        Ok(Self {
            config,
            serve,
            endpoint,
            public_endpoint,
            client,
            propfind: Method::from_bytes(b"PROPFIND").map_err(NodeError::storage_error)?,
            mkcol: Method::from_bytes(b"MKCOL").map_err(NodeError::storage_error)?,
            created_dirs: Mutex::new(HashSet::new()),
            responses: Arc::new(TtlCache::new(cache_size, cache_ttl)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.endpoint.as_str().trim_end_matches('/'),
            join_path(&self.config.path, path)
        )
    }

    fn public_url(&self, public: &Url, path: &str) -> String {
        format!(
            "{}{}",
            public.as_str().trim_end_matches('/'),
            join_path(&self.config.path, path)
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));

        match &self.config.username {
            Some(username) => builder.basic_auth(username, self.config.password.as_deref()),
            None => builder,
        }
    }

    async fn propfind(&self, path: &str, depth: u8) -> NodeResult<Option<Vec<DavEntry>>> {
        let response = self
            .request(self.propfind.clone(), path)
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(NodeError::storage_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::MULTI_STATUS => {
                let body = response.text().await.map_err(NodeError::storage_error)?;
                parse_multistatus(&body).map(Some)
            }
            status => Err(NodeError::StorageError(anyhow::anyhow!(
                "PROPFIND {} returned {}",
                path,
                status
            ))),
        }
    }

    /// Creates every missing ancestor collection of `path`.
    async fn ensure_parent(&self, path: &str) -> NodeResult<()> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut dir = String::new();

        for component in components.iter().take(components.len().saturating_sub(1)) {
            dir.push('/');
            dir.push_str(component);

            if self.is_created(&dir) {
                continue;
            }

            let response = self
                .request(self.mkcol.clone(), &dir)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(NodeError::storage_write_error)?;

            // 405 means the collection already exists
            let status = response.status();
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                    "MKCOL {} returned {}",
                    dir,
                    status
                )));
            }

            self.mark_created(&dir);
        }

        Ok(())
    }

    fn is_created(&self, dir: &str) -> bool {
        self.created_dirs
            .lock()
            .map(|dirs| dirs.contains(dir))
            .unwrap_or(false)
    }

    fn mark_created(&self, dir: &str) {
        if let Ok(mut dirs) = self.created_dirs.lock() {
            dirs.insert(dir.to_owned());
        }
    }

    async fn put(&self, path: &str, body: Body, size: u64) -> NodeResult<()> {
        self.ensure_parent(path).await?;

        let response = self
            .request(Method::PUT, path)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(NodeError::storage_write_error)?;

        if !response.status().is_success() {
            return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                "PUT {} returned {}",
                path,
                response.status()
            )));
        }

        Ok(())
    }

    async fn fetch(&self, url: &str) -> NodeResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(NodeError::storage_error)?
            .error_for_status()
            .map_err(NodeError::storage_error)?;

        response.bytes().await.map_err(NodeError::storage_error)
    }

    async fn resolve(&self, path: &str) -> NodeResult<ResponseFile> {
        if self.serve == ServePolicy::Redirect {
            if let Some(public) = &self.public_endpoint {
                return Ok(match self.get_size(path).await? {
                    Some(size) => ResponseFile::RemoteRedirect(self.public_url(public, path), size),
                    None => ResponseFile::NotFound,
                });
            }
        }

        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(NodeError::storage_error)?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(ResponseFile::NotFound);
        }

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|l| l.to_str().ok())
                .ok_or_else(|| {
                    NodeError::StorageError(anyhow::anyhow!("Redirect without a location"))
                })?;
            let location = response
                .url()
                .join(location)
                .map_err(NodeError::storage_error)?
                .to_string();

            if self.serve == ServePolicy::Proxy {
                return Ok(ResponseFile::Memory(self.fetch(&location).await?));
            }

            let size = self.get_size(path).await?.unwrap_or(0);
            return Ok(ResponseFile::RemoteRedirect(location, size));
        }

        if status.is_success() {
            let data = response.bytes().await.map_err(NodeError::storage_error)?;
            return Ok(ResponseFile::Memory(data));
        }

        Err(NodeError::StorageError(anyhow::anyhow!(
            "GET {} returned {}",
            path,
            status
        )))
    }
}

#[async_trait]
impl StorageBackend for WebdavBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Webdav
    }

    fn setup(&self, group: &TaskGroup) {
        self.responses.spawn_pruner(group);
    }

    async fn list_files(&self, shard: u8) -> NodeResult<Vec<FileInfo>> {
        let dir = shard_dir(shard);
        let entries = match self.propfind(&dir, 1).await? {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let files = entries
            .into_iter()
            .filter(|entry| !entry.is_collection)
            .filter_map(|entry| {
                let name = entry.href.trim_end_matches('/').rsplit('/').next()?;
                let name = urlencoding::decode(name).ok()?.into_owned();

                Some(FileInfo {
                    path: format!("{}/{}", dir, name),
                    name,
                    size: entry.size.unwrap_or(0),
                })
            })
            .collect();

        Ok(files)
    }

    async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()> {
        let file = File::open(source)
            .await
            .map_err(NodeError::storage_write_error)?;
        let body = Body::wrap_stream(ReaderStream::new(file));

        self.put(path, body, size).await?;
        self.responses.remove(&path.to_owned());

        Ok(())
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> NodeResult<()> {
        let size = data.len() as u64;
        self.put(path, Body::from(data), size).await
    }

    async fn delete(&self, path: &str) -> NodeResult<()> {
        let response = self
            .request(Method::DELETE, path)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(NodeError::storage_error)?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(NodeError::StorageError(anyhow::anyhow!(
                "DELETE {} returned {}",
                path,
                status
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

        let file = self.resolve(path).await?;
        if matches!(file, ResponseFile::RemoteRedirect(..)) {
            self.responses.set(key, file.clone());
        }

        Ok(file)
    }

    async fn get_size(&self, path: &str) -> NodeResult<Option<u64>> {
        let entries = match self.propfind(path, 0).await? {
            Some(entries) => entries,
            None => return Ok(None),
        };

        Ok(entries
            .into_iter()
            .find(|entry| !entry.is_collection)
            .and_then(|entry| entry.size))
    }
}

/// Parses a `207 Multi-Status` body.
///
/// Elements are matched by their local name since servers disagree on
/// which prefix to bind to `DAV:`.
fn parse_multistatus(xml: &str) -> NodeResult<Vec<DavEntry>> {
    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut open: Vec<&str> = Vec::new();
    let mut text = String::new();

    for token in Tokenizer::from(xml) {
        let closed = match token.map_err(NodeError::storage_error)? {
            Token::ElementStart { local, .. } => {
                let local = local.as_str();
                match local {
                    "response" => current = Some(DavEntry::default()),
                    "collection" if open.last() == Some(&"resourcetype") => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    _ => {}
                }

                open.push(local);
                text.clear();
                None
            }
            Token::Text { text: chunk } | Token::Cdata { text: chunk, .. } => {
                text.push_str(chunk.as_str());
                None
            }
            Token::ElementEnd {
                end: ElementEnd::Empty | ElementEnd::Close(..),
                ..
            } => open.pop(),
            _ => None,
        };

        let Some(closed) = closed else {
            continue;
        };

        match closed {
            "href" => {
                if let Some(entry) = current.as_mut() {
                    entry.href = unescape(text.trim());
                }
            }
            "getcontentlength" => {
                if let Some(entry) = current.as_mut() {
                    entry.size = text.trim().parse().ok();
                }
            }
            "response" => {
                if let Some(entry) = current.take().filter(|entry| !entry.href.is_empty()) {
                    entries.push(entry);
                }
            }
            _ => {}
        }
        text.clear();
    }

    Ok(entries)
}

/// Replaces the predefined XML entities.
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
