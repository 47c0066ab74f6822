//! Database entities.
//!
//! We use SeaORM and target SQLite. PostgreSQL works as well.

pub mod counter;
