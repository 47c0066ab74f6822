//! Control plane HTTP client.

pub mod token;


use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_compression::tokio::bufread::ZstdDecoder;
use displaydoc::Display;
use futures::TryStreamExt;
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    Client as HttpClient, Response, StatusCode, Url,
};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::time;
use tokio_util::io::StreamReader;

use crate::error::{NodeError, NodeResult};
use bmcl::file::{last_modified, BmclFile};
use bmcl::manifest::decode_files;

pub use token::TokenManager;

/// The User-Agent string of the node.
pub const NODE_USER_AGENT: &str = concat!("openbmclapi-cluster/", env!("CARGO_PKG_VERSION"));

/// Timeout of control plane requests other than downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The control plane client of one cluster.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    /// Base endpoint of the control plane.
    endpoint: Url,

    /// An initialized HTTP client.
    client: HttpClient,

    tokens: Arc<TokenManager>,
}

/// An API error.
#[derive(Debug, Display)]
pub enum ApiError {
    /// {0}
    Structured(StructuredApiError),

    /// HTTP {0}: {1}
    Unstructured(StatusCode, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredApiError {
    #[serde(default)]
    error: String,
    message: String,
}

/// A decoded file list.
#[derive(Debug, Clone, Default)]
pub struct FileList {
    /// Files with content.
    pub files: Vec<BmclFile>,

    /// Hashes of zero-byte files.
    pub zero_bytes: HashSet<String>,

    /// The highest modification time in the list.
    pub last_modified: i64,
}

/// Sync parameters suggested by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfiguration {
    pub source: String,
    pub concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct ConfigurationResponse {
    sync: SyncConfiguration,
}

impl ControlPlane {
    pub fn new(endpoint: Url, client: HttpClient, tokens: Arc<TokenManager>) -> Self {
        Self {
            endpoint,
            client,
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn cluster_id(&self) -> &str {
        self.tokens.cluster_id()
    }

    /// Returns the file list modified after `since` (in milliseconds).
    ///
    /// Returns `None` if nothing changed.
    pub async fn get_files(&self, since: i64) -> NodeResult<Option<FileList>> {
        let mut endpoint = self
            .endpoint
            .join("openbmclapi/files")
            .map_err(NodeError::request_error)?;
        endpoint
            .query_pairs_mut()
            .append_pair("lastModified", &since.to_string());

        let res = self
            .client
            .get(endpoint)
            .bearer_auth(self.tokens.get_token().await)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if !res.status().is_success() {
            return Err(ApiError::try_from_response(res).await?.into());
        }

        let stream = res
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let mut decoder = Box::pin(ZstdDecoder::new(StreamReader::new(stream)));

        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .await
            .map_err(NodeError::request_error)?;

        let files = decode_files(&decompressed)?;
        Ok(Some(split_files(files)))
    }

    /// Returns the suggested sync parameters.
    pub async fn get_configuration(&self) -> NodeResult<SyncConfiguration> {
        let endpoint = self
            .endpoint
            .join("openbmclapi/configuration")
            .map_err(NodeError::request_error)?;

        let res = self
            .client
            .get(endpoint)
            .bearer_auth(self.tokens.get_token().await)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if res.status().is_success() {
            let configuration: ConfigurationResponse = res.json().await?;
            Ok(configuration.sync)
        } else {
            Err(ApiError::try_from_response(res).await?.into())
        }
    }

    /// Starts downloading a file of the manifest.
    ///
    /// Only the wait for the response headers is bounded. Callers bound
    /// each read of the body.
    pub async fn download(&self, path: &str) -> NodeResult<Response> {
        let endpoint = self.download_url(path)?;

        let request = self
            .client
            .get(endpoint)
            .bearer_auth(self.tokens.get_token().await)
            .send();
        let res = time::timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(NodeError::request_error)??;

        if res.status().is_success() {
            Ok(res)
        } else {
            Err(ApiError::try_from_response(res).await?.into())
        }
    }

    /// Resolves the URL of a manifest path.
    ///
    /// Paths under `/openbmclapi/` are relative to the control plane
    /// root, other paths are relative to `/openbmclapi/download`.
    pub fn download_url(&self, path: &str) -> NodeResult<Url> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }

        let relative = if path.starts_with("/openbmclapi/") {
            path.trim_start_matches('/').to_string()
        } else {
            format!("openbmclapi/download/{}", path.trim_start_matches('/'))
        };

        self.endpoint
            .join(&relative)
            .map_err(NodeError::request_error)
    }
}

/// Moves zero-byte files out of a decoded list.
pub fn split_files(files: Vec<BmclFile>) -> FileList {
    let last_modified = last_modified(&files);
    let (empty, files): (Vec<_>, Vec<_>) = files.into_iter().partition(BmclFile::is_empty);

    FileList {
        files,
        zero_bytes: empty.into_iter().map(|file| file.hash).collect(),
        last_modified,
    }
}

/// Parses the control plane base URL.
///
/// The URL always ends with a slash so that relative API paths join
/// below it.
pub fn parse_base_url(base_url: &str) -> NodeResult<Url> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&base).map_err(NodeError::request_error)
}

pub fn build_http_client() -> NodeResult<HttpClient> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(NODE_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(NodeError::request_error)
}

impl StdError for ApiError {}

impl ApiError {
    async fn try_from_response(response: Response) -> NodeResult<Self> {
        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(s) => Ok(Self::Structured(s)),
            Err(_) => Ok(Self::Unstructured(status, text)),
        }
    }
}

impl From<ApiError> for NodeError {
    fn from(error: ApiError) -> Self {
        Self::request_error(error)
    }
}

impl fmt::Display for StructuredApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.error, self.message)
        }
    }
}
