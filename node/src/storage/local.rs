//! Local file storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::fs;

use super::{shard_dir, FileInfo, ResponseFile, StorageBackend, StorageKind};
use crate::error::{NodeError, NodeResult};

#[derive(Debug)]
pub struct LocalBackend {
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    pub path: PathBuf,
}

impl LocalBackend {
    pub async fn new(config: LocalStorageConfig) -> NodeResult<Self> {
        fs::create_dir_all(&config.path)
            .await
            .map_err(NodeError::storage_error)?;

        Ok(Self { config })
    }

    fn get_path(&self, p: &str) -> PathBuf {
        self.config.path.join(p.trim_start_matches('/'))
    }

    async fn create_parent(&self, path: &Path) -> NodeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(NodeError::storage_write_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn list_files(&self, shard: u8) -> NodeResult<Vec<FileInfo>> {
        let dir = shard_dir(shard);
        let mut entries = match fs::read_dir(self.get_path(&dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NodeError::storage_error(e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(NodeError::storage_error)?
        {
            let metadata = entry.metadata().await.map_err(NodeError::storage_error)?;
            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(FileInfo {
                path: format!("{}/{}", dir, name),
                name,
                size: metadata.len(),
            });
        }

        Ok(files)
    }

    async fn upload(&self, path: &str, source: &Path, size: u64) -> NodeResult<()> {
        let target = self.get_path(path);
        self.create_parent(&target).await?;

        let written = fs::copy(source, &target)
            .await
            .map_err(NodeError::storage_write_error)?;

        if written != size {
            let _ = fs::remove_file(&target).await;
            return Err(NodeError::StorageWriteError(anyhow::anyhow!(
                "Wrote {} bytes to {:?}, expected {}",
                written,
                target,
                size
            )));
        }

        Ok(())
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> NodeResult<()> {
        let target = self.get_path(path);
        self.create_parent(&target).await?;

        fs::write(&target, &data)
            .await
            .map_err(NodeError::storage_write_error)
    }

    async fn delete(&self, path: &str) -> NodeResult<()> {
        fs::remove_file(self.get_path(path))
            .await
            .map_err(NodeError::storage_error)
    }

    async fn get_file(&self, path: &str) -> NodeResult<ResponseFile> {
        let path = self.get_path(path);

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(ResponseFile::LocalPath(path, metadata.len())),
            Ok(_) => Ok(ResponseFile::NotFound),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ResponseFile::NotFound),
            Err(e) => Err(NodeError::storage_error(e)),
        }
    }

    async fn get_size(&self, path: &str) -> NodeResult<Option<u64>> {
        match fs::metadata(self.get_path(path)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NodeError::storage_error(e)),
        }
    }
}
