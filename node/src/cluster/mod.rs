//! Clusters.
//!
//! A cluster is an identity of the node in the federation. Each cluster
//! keeps its own control channel and goes through the following states:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> WantEnable -> Enabled
//!                                   ^                          |
//!                                   +-------- Disabling <------+
//! ```
//!
//! While enabled, the cluster reports its serving counters every minute.

pub mod agent;
pub mod manager;

#[cfg(test)]
mod tests;

use std::sync::Mutex;

use displaydoc::Display;
use serde::Serialize;

pub use agent::ClusterAgent;
pub use manager::ClusterManager;

/// The state of a cluster.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// disconnected
    Disconnected,

    /// connecting
    Connecting,

    /// connected
    Connected,

    /// enabling
    WantEnable,

    /// enabled
    Enabled,

    /// disabling
    Disabling,
}

/// Requests and bytes served since the last keep-alive.
#[derive(Debug, Default)]
pub struct Counters {
    inner: Mutex<CounterSnapshot>,
}

/// A point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a served request.
    pub fn record(&self, bytes: u64) {
        let mut inner = self.lock();
        inner.hits += 1;
        inner.bytes += bytes;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.lock()
    }

    /// Removes counts that have been reported.
    ///
    /// Requests served after the snapshot was taken are kept.
    pub fn subtract(&self, reported: &CounterSnapshot) {
        let mut inner = self.lock();
        inner.hits = inner.hits.saturating_sub(reported.hits);
        inner.bytes = inner.bytes.saturating_sub(reported.bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CounterSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CounterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.hits == 0 && self.bytes == 0
    }
}
