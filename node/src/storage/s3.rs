//! S3 and MinIO storage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use futures::future::join_all;
use reqwest::Url;
use serde::Deserialize;
use tokio::fs::File;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{FileInfo, ResponseFile, StorageBackend, StorageKind};
use crate::cache::TtlCache;
use crate::config::ServePolicy;
use crate::error::{NodeError, NodeResult};
use crate::task::TaskGroup;
use bmcl::file::{shard_name, DOWNLOAD_PREFIX};
use bmcl::stream::read_chunk_async;
use bmcl::util::Finally;

/// The chunk size for each part in a multipart upload.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// How long a bucket listing is reused.
const LISTING_TTL: Duration = Duration::from_secs(60);

/// How long file sizes are remembered.
const FILE_INFO_TTL: Duration = Duration::from_secs(120);

/// Extra validity of presigned URLs over the time they are cached.
const PRESIGN_MARGIN: Duration = Duration::from_secs(300);

type Listing = Arc<HashMap<String, Vec<FileInfo>>>;

/// The S3 storage backend.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct S3Backend {
    #[derivative(Debug = "ignore")]
    client: Client,
    config: S3StorageConfig,
    kind: StorageKind,
    serve: ServePolicy,
    cache_ttl: Duration,
    #[derivative(Debug = "ignore")]
    listing: Mutex<Option<(Instant, Listing)>>,
    #[derivative(Debug = "ignore")]
    sizes: Arc<TtlCache<String, Option<u64>>>,
    #[derivative(Debug = "ignore")]
    responses: Arc<TtlCache<String, ResponseFile>>,
}

/// S3 storage configuration.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct S3StorageConfig {
    /// Custom S3 endpoint.
    ///
    /// Required for MinIO and other S3-compatible storages.
    pub endpoint: Option<String>,

    /// The region.
    #[serde(default = "default_region")]
    pub region: String,

    /// The name of the bucket.
    pub bucket: String,

    /// Access key ID.
    ///
    /// If not specified, credentials are read from the environment.
    pub access_key: Option<String>,

    /// Secret access key.
    #[derivative(Debug = "ignore")]
    pub secret_key: Option<String>,

    /// Key prefix of all objects.
    #[serde(default)]
    pub prefix: String,

    /// Host of a CDN in front of the bucket.
    ///
    /// If set, clients are redirected to `{custom_host}/{key}`.
    pub custom_host: Option<String>,

    /// Authority that replaces the endpoint in presigned URLs.
    pub public_endpoint: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Backend {
    pub async fn new(
        config: S3StorageConfig,
        kind: StorageKind,
        serve: ServePolicy,
        cache_ttl: Duration,
    ) -> NodeResult<Self> {
        let s3_config = Self::config_builder(&config, kind)
            .await
            .region(Region::new(config.region.to_owned()))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
            kind,
            serve,
            cache_ttl,
            listing: Mutex::new(None),
            sizes: Arc::new(TtlCache::new(None, FILE_INFO_TTL)),
            responses: Arc::new(TtlCache::new(None, cache_ttl)),
        })
    }

    async fn config_builder(config: &S3StorageConfig, kind: StorageKind) -> S3ConfigBuilder {
        let shared_config = aws_config::load_from_env().await;
        let mut builder = S3ConfigBuilder::from(&shared_config);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "bmcl",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if kind == StorageKind::Minio || config.endpoint.is_some() {
            builder = builder.force_path_style(true);
        }

        builder
    }

    fn key(&self, path: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        let path = path.trim_start_matches('/');

        if prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", prefix, path)
        }
    }

    /// Lists every object of the download tree, grouped by shard.
    async fn list_all(&self) -> NodeResult<Listing> {
        let download_prefix = format!("{}/", self.key(DOWNLOAD_PREFIX));
        let mut shards: HashMap<String, Vec<FileInfo>> = HashMap::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(&download_prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(NodeError::storage_error)?;

            for object in page.contents() {
                let key = match object.key() {
                    Some(key) => key,
                    None => continue,
                };
                let relative = &key[download_prefix.len().min(key.len())..];

                let (shard, name) = match relative.split_once('/') {
                    Some((shard, name)) if !name.is_empty() && !name.contains('/') => (shard, name),
                    _ => continue,
                };

                shards.entry(shard.to_string()).or_default().push(FileInfo {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    path: format!("{}/{}", DOWNLOAD_PREFIX, relative),
                });
            }
        }

        Ok(Arc::new(shards))
    }

    async fn get_object_bytes(&self, path: &str) -> NodeResult<Option<Bytes>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.key(path))
            .send()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    return Ok(None);
                }
                return Err(NodeError::storage_error(e));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(NodeError::storage_error)?
            .into_bytes();

        Ok(Some(data))
    }

    async fn presign(&self, path: &str) -> NodeResult<String> {
        let presign_config = PresigningConfig::expires_in(self.cache_ttl + PRESIGN_MARGIN)
            .map_err(NodeError::storage_error)?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.key(path))
            .presigned(presign_config)
            .await
            .map_err(NodeError::storage_error)?;

        let uri = presigned.uri().to_string();
        match &self.config.public_endpoint {
            Some(public) => swap_authority(&uri, public),
            None => Ok(uri),
        }
    }

    async fn resolve(&self, path: &str) -> NodeResult<ResponseFile> {
        if let Some(host) = &self.config.custom_host {
            return Ok(match self.get_size(path).await? {
                Some(size) => ResponseFile::RemoteRedirect(
                    format!("{}/{}", host.trim_end_matches('/'), self.key(path)),
                    size,
                ),
                None => ResponseFile::NotFound,
            });
        }

        if self.serve == ServePolicy::Redirect {
            let size = match self.get_size(path).await? {
                Some(size) => size,
                None => return Ok(ResponseFile::NotFound),
            };

            match self.presign(path).await {
                Ok(url) => return Ok(ResponseFile::RemoteRedirect(url, size)),
                Err(e) => tracing::warn!("Failed to presign {}, serving the body: {}", path, e),
            }
        }

        Ok(match self.get_object_bytes(path).await? {
            Some(data) => ResponseFile::Memory(data),
            None => ResponseFile::NotFound,
        })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> NodeResult<()> {
        let put_object = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_length(data.len() as i64)
            .body(data.into())
            .send()
            .await
            .map_err(NodeError::storage_write_error)?;

        tracing::debug!("put_object -> {:#?}", put_object);

        Ok(())
    }

    fn forget(&self, path: &str) {
        let path = path.to_owned();
        self.sizes.remove(&path);
        self.responses.remove(&path);
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn setup(&self, group: &TaskGroup) {
        self.sizes.spawn_pruner(group);
        self.responses.spawn_pruner(group);
    }

    async fn list_files(&self, shard: u8) -> NodeResult<Vec<FileInfo>> {
        let listing = {
            let mut cached = self.listing.lock().await;

            match &*cached {
                Some((listed_at, listing)) if listed_at.elapsed() < LISTING_TTL => listing.clone(),
                _ => {
                    let listing = self.list_all().await?;
                    *cached = Some((Instant::now(), listing.clone()));
                    listing
                }
            }
        };

        let shard = shard_name(shard);
        Ok(listing.get(&shard).cloned().unwrap_or_default())
    }

    async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()> {
        let key = self.key(path);
        let mut stream = File::open(source)
            .await
            .map_err(NodeError::storage_write_error)?;

        let buf = BytesMut::with_capacity(CHUNK_SIZE);
        let first_chunk = read_chunk_async(&mut stream, buf)
            .await
            .map_err(NodeError::storage_write_error)?;

        if first_chunk.len() < CHUNK_SIZE {
            if first_chunk.len() as u64 != size {
                return Err(size_mismatch(path, first_chunk.len() as u64, size));
            }

            self.put_object(&key, first_chunk).await?;
            self.forget(path);
            return Ok(());
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(NodeError::storage_write_error)?;

        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| {
                NodeError::StorageWriteError(anyhow::anyhow!("Multipart upload has no ID"))
            })?
            .to_owned();

        let cleanup = Finally::new({
            let bucket = self.config.bucket.clone();
            let client = self.client.clone();
            let upload_id = upload_id.clone();
            let key = key.clone();

            async move {
                tracing::warn!("Upload was interrupted - Aborting multipart upload");

                let r = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;

                if let Err(e) = r {
                    tracing::warn!("Failed to abort multipart upload: {}", e);
                }
            }
        });

        let mut part_number = 1;
        let mut parts = Vec::new();
        let mut uploaded = 0u64;
        let mut first_chunk = Some(first_chunk);

        loop {
            let chunk = match first_chunk.take() {
                Some(chunk) => chunk,
                None => {
                    let buf = BytesMut::with_capacity(CHUNK_SIZE);
                    read_chunk_async(&mut stream, buf)
                        .await
                        .map_err(NodeError::storage_write_error)?
                }
            };

            if chunk.is_empty() {
                break;
            }
            uploaded += chunk.len() as u64;

            let fut = tokio::task::spawn(
                self.client
                    .upload_part()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(chunk.into())
                    .send(),
            );

            parts.push(fut);
            part_number += 1;
        }

        if uploaded != size {
            return Err(size_mismatch(path, uploaded, size));
        }

        let mut completed_parts = Vec::with_capacity(parts.len());
        for (idx, join_result) in join_all(parts).await.into_iter().enumerate() {
            let part = join_result
                .map_err(NodeError::storage_write_error)?
                .map_err(NodeError::storage_write_error)?;

            completed_parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .set_part_number(Some(idx as i32 + 1))
                    .set_checksum_crc32(part.checksum_crc32().map(str::to_string))
                    .set_checksum_crc32_c(part.checksum_crc32_c().map(str::to_string))
                    .set_checksum_sha1(part.checksum_sha1().map(str::to_string))
                    .set_checksum_sha256(part.checksum_sha256().map(str::to_string))
                    .build(),
            );
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let completion = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await
            .map_err(NodeError::storage_write_error)?;

        tracing::debug!("complete_multipart_upload -> {:#?}", completion);

        cleanup.cancel();
        self.forget(path);

        Ok(())
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> NodeResult<()> {
        self.put_object(&self.key(path), data).await?;
        self.forget(path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> NodeResult<()> {
        let deletion = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(NodeError::storage_error)?;

        tracing::debug!("delete_object -> {:#?}", deletion);
        self.forget(path);

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
        let key = path.to_owned();
        if let Some(size) = self.sizes.get(&key) {
            return Ok(size);
        }

        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.key(path))
            .send()
            .await;

        let size = match head {
            Ok(head) => Some(head.content_length().unwrap_or(0).max(0) as u64),
            Err(e) => {
                let e = e.into_service_error();
                if !e.is_not_found() {
                    return Err(NodeError::storage_error(e));
                }
                None
            }
        };

        self.sizes.set(key, size);
        Ok(size)
    }
}

fn size_mismatch(path: &str, actual: u64, expected: u64) -> NodeError {
    NodeError::StorageWriteError(anyhow::anyhow!(
        "Source of {} has {} bytes, expected {}",
        path,
        actual,
        expected
    ))
}

/// Replaces the scheme and authority of `url` with those of `public`.
fn swap_authority(url: &str, public: &str) -> NodeResult<String> {
    let mut url = Url::parse(url).map_err(NodeError::storage_error)?;
    let public = Url::parse(public).map_err(NodeError::storage_error)?;

    let invalid = |_| NodeError::StorageError(anyhow::anyhow!("Invalid public endpoint"));
    url.set_scheme(public.scheme()).map_err(invalid)?;
    url.set_host(public.host_str())
        .map_err(NodeError::storage_error)?;
    url.set_port(public.port()).map_err(invalid)?;

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_authority() {
        let swapped = swap_authority(
            "http://127.0.0.1:9000/bmcl/download/ab/ab01?X-Amz-Signature=abc",
            "https://s3.example.com",
        )
        .unwrap();

        assert_eq!(
            "https://s3.example.com/bmcl/download/ab/ab01?X-Amz-Signature=abc",
            swapped
        );
    }
}
