//! Counter persistence.
//!
//! Serving counters are flushed into per-hour aggregates keyed by
//! `(hour, cluster_id)`. Flushing the same hour twice adds up, so a
//! restarted node keeps the partial counts of the current hour.

pub mod entity;
pub mod migration;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::query::QueryOrder;
use sea_orm::{ActiveValue::Set, Database, DatabaseConnection};

use crate::error::{NodeError, NodeResult};
use entity::counter::{self, CounterModel, Entity as Counter, InsertExt};
use migration::{Migrator, MigratorTrait};

/// Counts of one cluster within one hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyCounter {
    /// Hours since the Unix epoch.
    pub hour: i64,
    pub cluster_id: String,
    pub hits: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Adds counts to the aggregate of an hour.
    async fn add_counters(&self, cluster_id: &str, hour: i64, hits: u64, bytes: u64)
        -> NodeResult<()>;

    /// Returns the aggregates of a cluster from `since_hour` on, oldest first.
    async fn get_counters(&self, cluster_id: &str, since_hour: i64)
        -> NodeResult<Vec<HourlyCounter>>;
}

/// A counter store backed by a relational database.
#[derive(Debug, Clone)]
pub struct SqlCounterStore {
    db: DatabaseConnection,
}

/// A counter store that forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<BTreeMap<(String, i64), (u64, u64)>>,
}

impl SqlCounterStore {
    /// Connects to a database.
    pub async fn connect(url: &str) -> NodeResult<Self> {
        let db = Database::connect(url)
            .await
            .map_err(NodeError::database_error)?;

        Ok(Self { db })
    }

    /// Applies pending migrations.
    pub async fn migrate(&self) -> NodeResult<()> {
        Migrator::up(&self.db, None)
            .await
            .map_err(NodeError::database_error)
    }
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn add_counters(
        &self,
        cluster_id: &str,
        hour: i64,
        hits: u64,
        bytes: u64,
    ) -> NodeResult<()> {
        let row = counter::ActiveModel {
            hour: Set(hour),
            cluster_id: Set(cluster_id.to_string()),
            hits: Set(to_db(hits)),
            bytes: Set(to_db(bytes)),
            ..Default::default()
        };

        Counter::insert(row)
            .on_conflict_accumulate()
            .exec_without_returning(&self.db)
            .await
            .map_err(NodeError::database_error)?;

        Ok(())
    }

    async fn get_counters(
        &self,
        cluster_id: &str,
        since_hour: i64,
    ) -> NodeResult<Vec<HourlyCounter>> {
        let rows = Counter::find()
            .filter(counter::Column::ClusterId.eq(cluster_id))
            .filter(counter::Column::Hour.gte(since_hour))
            .order_by_asc(counter::Column::Hour)
            .all(&self.db)
            .await
            .map_err(NodeError::database_error)?;

        Ok(rows.into_iter().map(HourlyCounter::from).collect())
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn add_counters(
        &self,
        cluster_id: &str,
        hour: i64,
        hits: u64,
        bytes: u64,
    ) -> NodeResult<()> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let entry = counters
            .entry((cluster_id.to_string(), hour))
            .or_default();
        entry.0 += hits;
        entry.1 += bytes;

        Ok(())
    }

    async fn get_counters(
        &self,
        cluster_id: &str,
        since_hour: i64,
    ) -> NodeResult<Vec<HourlyCounter>> {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(counters
            .range((cluster_id.to_string(), since_hour)..=(cluster_id.to_string(), i64::MAX))
            .map(|((cluster_id, hour), (hits, bytes))| HourlyCounter {
                hour: *hour,
                cluster_id: cluster_id.clone(),
                hits: *hits,
                bytes: *bytes,
            })
            .collect())
    }
}

impl From<CounterModel> for HourlyCounter {
    fn from(model: CounterModel) -> Self {
        Self {
            hour: model.hour,
            cluster_id: model.cluster_id,
            hits: model.hits.max(0) as u64,
            bytes: model.bytes.max(0) as u64,
        }
    }
}

/// Returns the hour a point in time belongs to.
pub fn hour_of(time: DateTime<Utc>) -> i64 {
    time.timestamp().div_euclid(3600)
}

fn to_db(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn sqlite_store(dir: &TempDir) -> SqlCounterStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("node.db").display());
        let store = SqlCounterStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    async fn check_accumulates(store: &dyn CounterStore) {
        store.add_counters("c1", 10, 1, 100).await.unwrap();
        store.add_counters("c1", 10, 2, 200).await.unwrap();
        store.add_counters("c1", 11, 5, 500).await.unwrap();
        store.add_counters("c2", 10, 7, 700).await.unwrap();

        let counters = store.get_counters("c1", 0).await.unwrap();
        assert_eq!(
            vec![
                HourlyCounter {
                    hour: 10,
                    cluster_id: "c1".to_string(),
                    hits: 3,
                    bytes: 300,
                },
                HourlyCounter {
                    hour: 11,
                    cluster_id: "c1".to_string(),
                    hits: 5,
                    bytes: 500,
                },
            ],
            counters
        );

        let counters = store.get_counters("c1", 11).await.unwrap();
        assert_eq!(1, counters.len());

        assert!(store.get_counters("c3", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sql_store() {
        let dir = TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        check_accumulates(&store).await;
    }

    #[tokio::test]
    async fn test_sql_store_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let store = sqlite_store(&dir).await;
            store.add_counters("c1", 42, 1, 10).await.unwrap();
        }

        let store = sqlite_store(&dir).await;
        store.add_counters("c1", 42, 1, 10).await.unwrap();

        let counters = store.get_counters("c1", 42).await.unwrap();
        assert_eq!(2, counters[0].hits);
        assert_eq!(20, counters[0].bytes);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCounterStore::new();
        check_accumulates(&store).await;
    }

    #[test]
    fn test_hour_of() {
        let time = Utc.with_ymd_and_hms(1970, 1, 1, 2, 59, 59).unwrap();
        assert_eq!(2, hour_of(time));
    }
}
