//! File synchronization.
//!
//! Every tick, the manifests of all clusters are merged and compared with
//! the contents of each writable storage. Missing files are downloaded
//! once by a pool of workers, verified against their digest and size,
//! then uploaded to every storage that lacks them.
//!
//! The engine remembers every file it has seen. An empty incremental
//! response still diffs against the full known set, so files that failed
//! during the previous sync are retried.


use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_channel as channel;
use futures::future::join_all;
use futures::TryStreamExt;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::config::Config;
use crate::control::ControlPlane;
use crate::error::{NodeError, NodeResult};
use crate::storage::{Storage, StorageManager};
use crate::task::{ScheduledTask, TaskGroup};
use bmcl::file::BmclFile;
use bmcl::hash::HashAlgorithm;
use bmcl::io::HashReader;

/// Size of the buffer used to copy downloads.
const COPY_BUFFER: usize = 64 * 1024;

/// Keeps storages in sync with the manifests of the clusters.
#[derive(Debug)]
pub struct SyncEngine {
    config: Arc<Config>,
    planes: Vec<ControlPlane>,
    storages: Arc<StorageManager>,

    /// Every file seen so far, held while a sync runs.
    known: Mutex<KnownFiles>,

    /// Hashes of zero-byte files.
    zero_bytes: RwLock<HashSet<String>>,

    progress: Arc<SyncProgress>,
}

#[derive(Debug, Default)]
struct KnownFiles {
    /// Files by hash, with the index of the control plane listing them.
    files: HashMap<String, (BmclFile, usize)>,

    /// Modification time to resume from, per control plane.
    since: Vec<i64>,
}

/// A file to download and the storages to upload it to.
#[derive(Debug)]
struct SyncJob {
    file: BmclFile,
    plane: usize,
    targets: Vec<Arc<Storage>>,
}

/// Live counters of a sync.
#[derive(Debug, Default)]
pub struct SyncProgress {
    total: AtomicU64,
    total_bytes: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// A copy of [`SyncProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Files to synchronize.
    pub total: u64,

    /// Bytes to download.
    pub total_bytes: u64,

    pub success: u64,
    pub failed: u64,

    /// Bytes downloaded so far.
    pub bytes: u64,
}

impl SyncEngine {
    pub fn new(config: Arc<Config>, planes: Vec<ControlPlane>, storages: Arc<StorageManager>) -> Self {
        let since = vec![0; planes.len()];

        Self {
            config,
            planes,
            storages,
            known: Mutex::new(KnownFiles {
                files: HashMap::new(),
                since,
            }),
            zero_bytes: RwLock::new(HashSet::new()),
            progress: Arc::new(SyncProgress::default()),
        }
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Returns whether a hash names a zero-byte file.
    ///
    /// The digests of the empty string always count.
    pub fn is_empty_file(&self, hash: &str) -> bool {
        let hash = hash.to_ascii_lowercase();

        if HashAlgorithm::from_hash(&hash).hash_bytes(b"") == hash {
            return true;
        }

        self.zero_bytes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&hash)
    }

    /// Runs a sync every `sync.interval`.
    pub fn setup(self: &Arc<Self>, group: &TaskGroup) -> ScheduledTask {
        let engine = Arc::downgrade(self);

        group.schedule_repeat(self.config.sync.interval, move || {
            let engine = engine.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    if let Err(e) = engine.sync().await {
                        tracing::error!("Sync failed: {}", e);
                    }
                }
            }
        })
    }

    /// Synchronizes every writable online storage.
    ///
    /// A sync that starts while another one runs waits for it.
    #[instrument(skip_all)]
    pub async fn sync(&self) -> NodeResult<ProgressSnapshot> {
        let mut known = self.known.lock().await;
        let started = Instant::now();

        self.update_manifest(&mut known).await?;
        if known.files.is_empty() {
            tracing::info!("The manifest is empty, nothing to sync");
            return Ok(ProgressSnapshot::default());
        }

        let jobs = self.plan(&known).await;
        self.progress.reset(&jobs);

        if jobs.is_empty() {
            tracing::info!("All {} files are in place", known.files.len());
            return Ok(self.progress.snapshot());
        }

        let workers = self.worker_count().await.min(jobs.len());
        tracing::info!(
            "Synchronizing {} files ({} bytes) with {} workers",
            jobs.len(),
            self.progress.snapshot().total_bytes,
            workers
        );

        let (sender, receiver) = channel::bounded(workers * 2);
        let feed = async move {
            for job in jobs {
                if sender.send(job).await.is_err() {
                    break;
                }
            }
        };
        let pool = join_all((0..workers).map(|_| self.worker(receiver.clone())));
        drop(receiver);
        tokio::join!(feed, pool);

        let snapshot = self.progress.snapshot();
        tracing::info!(
            success = snapshot.success,
            failed = snapshot.failed,
            bytes = snapshot.bytes,
            "Sync finished in {}",
            humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()))
        );

        Ok(snapshot)
    }

    /// Merges the latest manifests into the known files.
    async fn update_manifest(&self, known: &mut KnownFiles) -> NodeResult<()> {
        let responses = join_all(
            self.planes
                .iter()
                .zip(known.since.iter())
                .map(|(plane, since)| plane.get_files(*since)),
        )
        .await;

        let mut first_error = None;
        let mut any_ok = false;

        for (index, response) in responses.into_iter().enumerate() {
            match response {
                Ok(Some(list)) => {
                    any_ok = true;
                    tracing::debug!(
                        cluster = %self.planes[index].cluster_id(),
                        "Received {} files",
                        list.files.len()
                    );

                    for file in list.files {
                        known
                            .files
                            .entry(file.hash.clone())
                            .or_insert((file, index));
                    }

                    let mut zero_bytes = self
                        .zero_bytes
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    for hash in list.zero_bytes {
                        known.files.remove(&hash);
                        zero_bytes.insert(hash);
                    }

                    known.since[index] = known.since[index].max(list.last_modified);
                }
                Ok(None) => {
                    any_ok = true;
                    tracing::debug!(
                        cluster = %self.planes[index].cluster_id(),
                        "The manifest has not changed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        cluster = %self.planes[index].cluster_id(),
                        "Failed to fetch the manifest: {}",
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !any_ok => Err(e),
            _ => Ok(()),
        }
    }

    /// Lists every writable online storage and returns what is missing.
    async fn plan(&self, known: &KnownFiles) -> Vec<SyncJob> {
        let targets: Vec<Arc<Storage>> = self
            .storages
            .online_storages()
            .into_iter()
            .filter(|storage| !storage.is_readonly())
            .collect();

        if targets.is_empty() {
            tracing::warn!("No writable storage is online");
            return Vec::new();
        }

        let listings = join_all(targets.iter().map(|storage| storage.list_download_files())).await;

        let mut jobs: HashMap<&str, SyncJob> = HashMap::new();
        for (storage, listing) in targets.iter().zip(listings) {
            let present = match listing {
                Ok(present) => present,
                Err(e) => {
                    tracing::error!(storage = %storage.id(), "Failed to list files: {}", e);
                    continue;
                }
            };

            let mut missing = 0;
            for (hash, (file, plane)) in &known.files {
                let in_place = present
                    .get(hash)
                    .map(|info| info.size == file.size)
                    .unwrap_or(false);
                if in_place {
                    continue;
                }

                missing += 1;
                jobs.entry(hash.as_str())
                    .or_insert_with(|| SyncJob {
                        file: file.clone(),
                        plane: *plane,
                        targets: Vec::new(),
                    })
                    .targets
                    .push(storage.clone());
            }

            tracing::info!(storage = %storage.id(), "{} files are missing", missing);
        }

        jobs.into_values().collect()
    }

    /// Returns the highest concurrency suggested by the control planes.
    async fn worker_count(&self) -> usize {
        let suggested = join_all(self.planes.iter().map(|plane| plane.get_configuration()))
            .await
            .into_iter()
            .filter_map(|configuration| match configuration {
                Ok(configuration) => Some(configuration.concurrency),
                Err(e) => {
                    tracing::warn!("Failed to fetch the sync configuration: {}", e);
                    None
                }
            })
            .max();

        suggested
            .unwrap_or(self.config.sync.default_concurrency)
            .max(1)
    }

    async fn worker(&self, receiver: channel::Receiver<SyncJob>) {
        while let Ok(job) = receiver.recv().await {
            match self.sync_file(&job).await {
                Ok(()) => {
                    self.progress.success.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(hash = %job.file.hash, "Failed to sync file: {}", e);
                    self.progress.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Downloads a file and uploads it to its targets.
    #[instrument(skip_all, fields(hash = %job.file.hash))]
    async fn sync_file(&self, job: &SyncJob) -> NodeResult<()> {
        let temp = self.download(job).await?;

        // One backend at a time, so a file never competes with itself
        let mut first_error = None;
        for storage in &job.targets {
            if let Err(e) = self.upload(storage, &job.file, temp.path()).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Downloads and verifies a file, retrying on failure.
    async fn download(&self, job: &SyncJob) -> NodeResult<NamedTempFile> {
        let sync = &self.config.sync;
        let attempts = sync.download_retries.max(1);
        let mut attempt = 1;

        loop {
            let mut counted = 0;
            let result = self.download_once(job, &mut counted).await;

            match result {
                Ok(temp) => return Ok(temp),
                Err(e) => {
                    // Progress only counts verified bytes
                    self.progress.bytes.fetch_sub(counted, Ordering::Relaxed);

                    if attempt >= attempts || !e.is_transient() {
                        return Err(e);
                    }

                    tracing::warn!(
                        "Download attempt {}/{} failed, retrying in {}: {}",
                        attempt,
                        attempts,
                        humantime::format_duration(sync.download_retry_delay),
                        e
                    );
                    time::sleep(sync.download_retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn download_once(&self, job: &SyncJob, counted: &mut u64) -> NodeResult<NamedTempFile> {
        let file = &job.file;

        tokio::fs::create_dir_all(&self.config.sync.cache_dir)
            .await
            .map_err(NodeError::storage_write_error)?;
        let temp =
            NamedTempFile::new_in(&self.config.sync.cache_dir).map_err(NodeError::storage_write_error)?;
        let mut out = File::from_std(temp.reopen().map_err(NodeError::storage_write_error)?);

        let res = self.planes[job.plane].download(&file.path).await?;
        let stream = res
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let (mut reader, finalized) =
            HashReader::new(StreamReader::new(stream), file.algorithm().hasher());

        let read_timeout = self.config.sync.read_timeout;
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let read = time::timeout(read_timeout, reader.read(&mut buf))
                .await
                .map_err(NodeError::request_error)?
                .map_err(NodeError::request_error)?;
            if read == 0 {
                break;
            }

            out.write_all(&buf[..read])
                .await
                .map_err(NodeError::storage_write_error)?;

            *counted += read as u64;
            self.progress.bytes.fetch_add(read as u64, Ordering::Relaxed);
        }
        out.flush().await.map_err(NodeError::storage_write_error)?;

        let (actual_hash, actual_size) = finalized
            .get()
            .cloned()
            .ok_or(NodeError::InternalServerError)?;

        if !actual_hash.eq_ignore_ascii_case(&file.hash) || actual_size != file.size {
            return Err(NodeError::VerificationError {
                expected: file.hash.clone(),
                actual_hash,
                expected_size: file.size,
                actual_size,
            });
        }

        Ok(temp)
    }

    /// Uploads a downloaded file, retrying with a growing delay.
    async fn upload(&self, storage: &Storage, file: &BmclFile, source: &Path) -> NodeResult<()> {
        let sync = &self.config.sync;
        let attempts = sync.upload_retries.max(1);
        let mut attempt = 1;

        loop {
            match storage.upload(&file.storage_path(), source, file.size).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    tracing::error!(storage = %storage.id(), "Giving up uploading: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = sync.upload_retry_delay * attempt as u32;
                    tracing::warn!(
                        storage = %storage.id(),
                        "Upload attempt {}/{} failed, retrying in {}: {}",
                        attempt,
                        attempts,
                        humantime::format_duration(delay),
                        e
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl SyncProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self, jobs: &[SyncJob]) {
        let total_bytes = jobs.iter().map(|job| job.file.size).sum();

        self.total.store(jobs.len() as u64, Ordering::Relaxed);
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}
