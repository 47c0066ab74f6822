//! HTTP API.
//!
//! Clients reach the node through signed URLs handed out by the control
//! plane:
//!
//! - `GET /download/{hash}?s=..&e=..` serves a file
//! - `GET /measure/{size}?s=..&e=..` serves `size` MiB of zeros

mod download;
mod measure;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Extension,
    http::{header, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use derivative::Derivative;
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::cache::FileCache;
use crate::cluster::{ClusterAgent, Counters};
use crate::error::{NodeError, NodeResult};
use crate::storage::{ResponseFile, StorageManager};
use crate::sync::SyncEngine;
use bmcl::signing;

/// Header carrying the hash of a served file.
pub const HASH_HEADER: HeaderName = HeaderName::from_static("x-bmclapi-hash");

pub type State = Arc<ApiState>;

/// Shared state of the handlers.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ApiState {
    keys: Vec<SigningKey>,
    storages: Arc<StorageManager>,
    sync: Arc<SyncEngine>,

    #[derivative(Debug = "ignore")]
    file_cache: Arc<FileCache>,

    skip_sign: bool,
}

/// A cluster whose signatures the node accepts.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct SigningKey {
    pub cluster_id: String,

    #[derivative(Debug = "ignore")]
    pub secret: String,

    /// Counters credited with requests signed by this cluster.
    pub counters: Arc<Counters>,
}

/// The signature of a request.
#[derive(Debug, Deserialize)]
struct SignatureQuery {
    s: Option<String>,
    e: Option<String>,
}

impl ApiState {
    pub fn new(
        keys: Vec<SigningKey>,
        storages: Arc<StorageManager>,
        sync: Arc<SyncEngine>,
        file_cache: Arc<FileCache>,
        skip_sign: bool,
    ) -> State {
        Arc::new(Self {
            keys,
            storages,
            sync,
            file_cache,
            skip_sign,
        })
    }

    /// Returns the cluster that signed `subject`.
    ///
    /// With signature checks disabled, the first cluster is credited.
    fn verify(&self, subject: &str, query: &SignatureQuery) -> NodeResult<&SigningKey> {
        if self.skip_sign {
            return self.keys.first().ok_or(NodeError::InternalServerError);
        }

        let (Some(s), Some(e)) = (&query.s, &query.e) else {
            return Err(NodeError::Forbidden);
        };

        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.keys
            .iter()
            .find(|key| signing::verify(&key.secret, subject, s, e, now).is_ok())
            .ok_or(NodeError::Forbidden)
    }

    /// Looks the file with `hash` up, trying the weighted pick first and
    /// then every other online storage.
    async fn find_file(&self, hash: &str) -> NodeResult<ResponseFile> {
        if let Some(data) = self.file_cache.get(hash) {
            return Ok(ResponseFile::Memory(data));
        }

        let first = self.storages.get_weight_storage()?;
        let others = self
            .storages
            .online_storages()
            .into_iter()
            .filter(|storage| storage.id() != first.id());

        for storage in std::iter::once(first.clone()).chain(others) {
            match storage.get_response_file(hash).await {
                Ok(ResponseFile::NotFound) => {}
                Ok(file) => {
                    if let ResponseFile::Memory(data) = &file {
                        self.file_cache.put(hash.to_string(), data.clone());
                    }
                    return Ok(file);
                }
                Err(e) => {
                    tracing::warn!(storage = %storage.id(), "Failed to look up {}: {}", hash, e);
                }
            }
        }

        Err(NodeError::NotFound)
    }
}

impl SigningKey {
    pub fn from_agent(agent: &ClusterAgent) -> Self {
        Self {
            cluster_id: agent.id().to_string(),
            secret: agent.secret().to_string(),
            counters: agent.counters().clone(),
        }
    }
}

/// Builds the response for a resolved file.
async fn respond(hash: &str, file: ResponseFile) -> NodeResult<Response> {
    let hash_header = (HASH_HEADER, hash.to_string());

    match file {
        ResponseFile::NotFound => Err(NodeError::NotFound),
        ResponseFile::RemoteRedirect(url, _) => {
            Ok((StatusCode::FOUND, [(header::LOCATION, url), hash_header]).into_response())
        }
        ResponseFile::Memory(data) => Ok(sized_response(hash_header, data.len() as u64, Body::from(data))),
        ResponseFile::LocalPath(path, size) => {
            let file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(NodeError::NotFound),
                Err(e) => return Err(NodeError::storage_error(e)),
            };

            Ok(sized_response(
                hash_header,
                size,
                Body::from_stream(ReaderStream::new(file)),
            ))
        }
    }
}

fn sized_response(hash_header: (HeaderName, String), size: u64, body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, size.to_string()), hash_header],
        body,
    )
        .into_response()
}

/// The fallback route.
async fn fallback(_: Uri) -> NodeResult<()> {
    Err(NodeError::NotFound)
}

pub fn get_router(state: State) -> Router {
    Router::new()
        .route("/download/:hash", get(download::download))
        .route("/measure/:size", get(measure::measure))
        .fallback(fallback)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}
