//! Cluster status log.
//!
//! Every protocol event of a cluster is appended to
//! `{cluster_status_dir}/{cluster_id}.log`, one JSON object per line:
//!
//! ```text
//! {"time":"2024-03-01T12:00:00Z","type":"client.emit","event":"enable","data":{..}}
//! ```
//!
//! Failed `enable` attempts recorded in the log drive the failure
//! budget: see [`enable_wait`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{NodeError, NodeResult};

/// The kind of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// The node emitted an event.
    #[serde(rename = "client.emit")]
    ClientEmit,

    /// The control plane acknowledged an event.
    #[serde(rename = "server.ack")]
    ServerAck,

    /// The control plane pushed an event.
    #[serde(rename = "server.push")]
    ServerPush,

    /// An `enable` attempt failed.
    #[serde(rename = "enable.failed")]
    EnableFailed,

    /// The cluster was disabled after repeated keep-alive failures.
    #[serde(rename = "kicked")]
    Kicked,
}

/// A line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,

    #[serde(rename = "type")]
    pub kind: EntryKind,

    pub event: String,

    #[serde(default)]
    pub data: Value,
}

/// The status log of one cluster.
#[derive(Debug)]
pub struct ClusterStatusLog {
    path: PathBuf,

    /// How long entries are kept.
    retention: Duration,

    /// Times of recent `enable` failures, oldest first.
    failures: Mutex<Vec<DateTime<Utc>>>,
}

impl ClusterStatusLog {
    /// Opens the log of a cluster.
    ///
    /// Entries older than `retention` are dropped.
    pub async fn open(
        dir: &Path,
        cluster_id: &str,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> NodeResult<Self> {
        fs::create_dir_all(dir).await.map_err(NodeError::storage_error)?;
        let path = dir.join(format!("{}.log", cluster_id));

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => parse_entries(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(NodeError::storage_error(e)),
        };

        let kept = drop_expired(&path, entries, now, retention).await?;
        let failures = kept
            .iter()
            .filter(|entry| entry.kind == EntryKind::EnableFailed)
            .map(|entry| entry.time)
            .collect();

        Ok(Self {
            path,
            retention,
            failures: Mutex::new(failures),
        })
    }

    /// Drops entries older than the retention period from the log.
    pub async fn compact(&self, now: DateTime<Utc>) -> NodeResult<()> {
        let mut failures = self.failures.lock().await;

        let entries = match fs::read_to_string(&self.path).await {
            Ok(content) => parse_entries(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(NodeError::storage_error(e)),
        };
        drop_expired(&self.path, entries, now, self.retention).await?;

        let cutoff = window_start(now, self.retention);
        failures.retain(|time| *time >= cutoff);

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry.
    pub async fn append(&self, kind: EntryKind, event: &str, data: Value) -> NodeResult<()> {
        self.append_entry(LogEntry {
            time: Utc::now(),
            kind,
            event: event.to_string(),
            data,
        })
        .await
    }

    /// Appends an entry, logging failures instead of returning them.
    pub async fn record(&self, kind: EntryKind, event: &str, data: Value) {
        if let Err(e) = self.append(kind, event, data).await {
            tracing::warn!(path = %self.path.display(), "Failed to write status log: {}", e);
        }
    }

    pub async fn append_entry(&self, entry: LogEntry) -> NodeResult<()> {
        // Serialized through the failure list lock
        let mut failures = self.failures.lock().await;

        let mut line = serde_json::to_string(&entry).map_err(NodeError::storage_error)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(NodeError::storage_error)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(NodeError::storage_error)?;

        if entry.kind == EntryKind::EnableFailed {
            failures.push(entry.time);
        }

        Ok(())
    }

    /// Records a failed `enable` attempt at `time`.
    pub async fn record_enable_failure(&self, time: DateTime<Utc>, error: &str) -> NodeResult<()> {
        self.append_entry(LogEntry {
            time,
            kind: EntryKind::EnableFailed,
            event: "enable".to_string(),
            data: Value::String(error.to_string()),
        })
        .await
    }

    /// Returns how long to wait before the next `enable` attempt.
    pub async fn enable_wait(
        &self,
        now: DateTime<Utc>,
        interval: Duration,
        times: usize,
    ) -> Duration {
        let mut failures = self.failures.lock().await;

        // Failures that left the window never count again
        let start = window_start(now, interval);
        failures.retain(|time| *time > start);

        enable_wait(&failures, now, interval, times)
    }

    /// Returns every entry of the log.
    pub async fn read_entries(&self) -> NodeResult<Vec<LogEntry>> {
        let _guard = self.failures.lock().await;

        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(parse_entries(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(NodeError::storage_error(e)),
        }
    }
}

/// Returns how long to wait before the next `enable` attempt.
///
/// If at least `times` failures happened within `interval` before `now`,
/// the wait lasts until the oldest of them leaves the window. Otherwise
/// no wait is needed.
pub fn enable_wait(
    failures: &[DateTime<Utc>],
    now: DateTime<Utc>,
    interval: Duration,
    times: usize,
) -> Duration {
    let window = chrono_duration(interval);
    let start = window_start(now, interval);
    let recent: Vec<&DateTime<Utc>> = failures
        .iter()
        .filter(|time| **time > start && **time <= now)
        .collect();

    if times == 0 || recent.len() < times {
        return Duration::ZERO;
    }

    // The oldest failure that keeps the count at the limit
    let oldest = recent[recent.len() - times];
    oldest
        .checked_add_signed(window)
        .and_then(|until| (until - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

fn parse_entries(content: &str) -> Vec<LogEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping malformed status log line: {}", e);
                None
            }
        })
        .collect()
}

/// Rewrites the log at `path` without the entries older than `retention`.
async fn drop_expired(
    path: &Path,
    entries: Vec<LogEntry>,
    now: DateTime<Utc>,
    retention: Duration,
) -> NodeResult<Vec<LogEntry>> {
    let cutoff = window_start(now, retention);
    let total = entries.len();
    let kept: Vec<LogEntry> = entries
        .into_iter()
        .filter(|entry| entry.time >= cutoff)
        .collect();

    if kept.len() != total {
        tracing::debug!(
            path = %path.display(),
            "Pruning {} old status log entries",
            total - kept.len()
        );
        rewrite(path, &kept).await?;
    }

    Ok(kept)
}

async fn rewrite(path: &Path, entries: &[LogEntry]) -> NodeResult<()> {
    let mut content = String::new();
    for entry in entries {
        content.push_str(&serde_json::to_string(entry).map_err(NodeError::storage_error)?);
        content.push('\n');
    }

    let temp = path.with_extension("log.tmp");
    fs::write(&temp, content)
        .await
        .map_err(NodeError::storage_error)?;
    fs::rename(&temp, path)
        .await
        .map_err(NodeError::storage_error)?;

    Ok(())
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_enable_wait() {
        let failures: Vec<_> = [0, 100, 200, 300, 400].into_iter().map(at).collect();

        // Under the limit
        assert_eq!(Duration::ZERO, enable_wait(&failures[..4], at(500), HOUR, 5));

        // At the limit, wait until the first failure is an hour old
        assert_eq!(
            Duration::from_secs(3100),
            enable_wait(&failures, at(500), HOUR, 5)
        );

        // Once it aged out, go ahead
        assert_eq!(Duration::ZERO, enable_wait(&failures, at(3600), HOUR, 5));

        // With a lower limit, only the newest failures count
        assert_eq!(
            Duration::from_secs(3500),
            enable_wait(&failures, at(500), HOUR, 1)
        );
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let retention = Duration::from_secs(30 * 86400);

        let log = ClusterStatusLog::open(dir.path(), "c1", retention, Utc::now())
            .await
            .unwrap();
        log.append(EntryKind::ClientEmit, "enable", json!({ "port": 4000 }))
            .await
            .unwrap();
        log.record_enable_failure(Utc::now(), "rejected")
            .await
            .unwrap();

        let entries = log.read_entries().await.unwrap();
        assert_eq!(2, entries.len());
        assert_eq!(EntryKind::ClientEmit, entries[0].kind);
        assert_eq!(json!({ "port": 4000 }), entries[0].data);

        let content = tokio::fs::read_to_string(dir.path().join("c1.log"))
            .await
            .unwrap();
        assert!(content.lines().next().unwrap().contains(r#""type":"client.emit""#));

        // Failures survive a restart
        let log = ClusterStatusLog::open(dir.path(), "c1", retention, Utc::now())
            .await
            .unwrap();
        assert!(
            log.enable_wait(Utc::now(), HOUR, 1).await > Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_failures_leave_the_window() {
        let dir = TempDir::new().unwrap();
        let log = ClusterStatusLog::open(dir.path(), "c1", HOUR, at(0))
            .await
            .unwrap();

        log.record_enable_failure(at(0), "rejected").await.unwrap();
        log.record_enable_failure(at(10), "rejected").await.unwrap();
        assert_eq!(
            Duration::from_secs(3580),
            log.enable_wait(at(20), HOUR, 2).await
        );
        assert_eq!(2, log.failures.lock().await.len());

        assert_eq!(Duration::ZERO, log.enable_wait(at(3605), HOUR, 2).await);
        assert_eq!(vec![at(10)], *log.failures.lock().await);
    }

    #[tokio::test]
    async fn test_compact() {
        let dir = TempDir::new().unwrap();
        let log = ClusterStatusLog::open(dir.path(), "c1", HOUR, at(0))
            .await
            .unwrap();

        log.record_enable_failure(at(0), "rejected").await.unwrap();
        log.append_entry(LogEntry {
            time: at(1800),
            kind: EntryKind::Kicked,
            event: "keep-alive".to_string(),
            data: Value::Null,
        })
        .await
        .unwrap();

        log.compact(at(3700)).await.unwrap();

        let entries = log.read_entries().await.unwrap();
        assert_eq!(1, entries.len());
        assert_eq!(EntryKind::Kicked, entries[0].kind);
        assert!(log.failures.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_retention() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c1.log");

        let old = LogEntry {
            time: at(0),
            kind: EntryKind::EnableFailed,
            event: "enable".to_string(),
            data: Value::Null,
        };
        let new = LogEntry {
            time: at(40 * 86400),
            ..old.clone()
        };
        let content = format!(
            "{}\nnot json\n{}\n",
            serde_json::to_string(&old).unwrap(),
            serde_json::to_string(&new).unwrap()
        );
        tokio::fs::write(&path, content).await.unwrap();

        let log = ClusterStatusLog::open(
            dir.path(),
            "c1",
            Duration::from_secs(30 * 86400),
            at(41 * 86400),
        )
        .await
        .unwrap();

        assert_eq!(vec![new], log.read_entries().await.unwrap());
    }
}
