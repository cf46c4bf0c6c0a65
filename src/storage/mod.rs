//! # Storage and Persistence
//!
//! The relational system of record: a PostgreSQL pool with file migrations,
//! an in-memory twin for tests and dry runs, and the [`Session`] unit of
//! work used by every manager.

pub mod memory;
pub mod migrations;
pub mod pool;
pub mod record;
pub mod session;
pub mod tables;

#[cfg(all(test, feature = "postgres_tests"))]
pub mod test_helpers;

pub use crate::config::DatabaseConfig;
pub use memory::{MemorySession, MemoryStore};
pub use migrations::{
    get_migration_version, list_applied_migrations, run_migrations, validate_migrations,
    MigrationInfo,
};
pub use pool::{create_pool, DbPool};
pub use record::{Record, RecordFilter};
pub use session::{Session, Store};
pub use tables::*;
