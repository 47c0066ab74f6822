use sea_orm_migration::prelude::*;

use crate::database::entity::counter::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240301_000001_create_counter_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Column::Hour).big_integer().not_null())
                    .col(ColumnDef::new(Column::ClusterId).string_len(64).not_null())
                    .col(
                        ColumnDef::new(Column::Hits)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Column::Bytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-counter-hour-cluster")
                    .table(Entity)
                    .col(Column::Hour)
                    .col(Column::ClusterId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}
