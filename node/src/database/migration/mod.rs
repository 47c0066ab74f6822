//! Database migrations.

pub use sea_orm_migration::*;

mod m20240301_000001_create_counter_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20240301_000001_create_counter_table::Migration)]
    }
}
