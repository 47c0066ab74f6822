//! Hourly serving counters.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Alias, Expr, OnConflict};
use sea_orm::Insert;

pub type CounterModel = Model;

pub trait InsertExt {
    /// Adds the inserted counts to an existing row of the same hour.
    fn on_conflict_accumulate(self) -> Self;
}

/// Requests served by a cluster within one hour.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "counter")]
pub struct Model {
    /// Unique numeric ID of the row.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Hours since the Unix epoch.
    #[sea_orm(indexed)]
    pub hour: i64,

    /// ID of the cluster that served the requests.
    #[sea_orm(column_type = "String(Some(64))", indexed)]
    pub cluster_id: String,

    /// Number of requests served.
    pub hits: i64,

    /// Number of bytes served.
    pub bytes: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl InsertExt for Insert<ActiveModel> {
    fn on_conflict_accumulate(self) -> Self {
        let excluded = Alias::new("excluded");

        self.on_conflict(
            OnConflict::columns([Column::Hour, Column::ClusterId])
                .value(
                    Column::Hits,
                    Expr::col((Entity, Column::Hits))
                        .add(Expr::col((excluded.clone(), Column::Hits))),
                )
                .value(
                    Column::Bytes,
                    Expr::col((Entity, Column::Bytes))
                        .add(Expr::col((excluded, Column::Bytes))),
                )
                .to_owned(),
        )
    }
}

impl ActiveModelBehavior for ActiveModel {}
