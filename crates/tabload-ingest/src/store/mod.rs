//! Storage backends
//!
//! Two seams: [`BatchSink`] persists rows with skip-on-conflict semantics,
//! and [`TableCatalog`] manages the physical tables a partition owns.
//! [`PgStore`] targets Postgres; [`MemoryStore`] is an in-process stand-in
//! used for dry runs and tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::{Identifier, PartitionRoute, PartitionSchema, TableNames};
use crate::types::NormalizedRecord;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("table {0} does not exist")]
    TableMissing(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    #[error("store rejected the request: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Destination for normalized rows
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Insert `rows` into `table`, skipping rows whose natural key already
    /// exists. Returns the number of rows actually inserted.
    async fn insert_batch(
        &self,
        table: &Identifier,
        schema: &PartitionSchema,
        rows: &[NormalizedRecord],
    ) -> StoreResult<u64>;
}

/// Table lifecycle operations needed by staging and cutover
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Create the staging table with a uniqueness constraint on the natural key
    async fn ensure_staging(&self, route: &PartitionRoute) -> StoreResult<()>;

    async fn truncate(&self, table: &Identifier) -> StoreResult<()>;

    async fn count_rows(&self, table: &Identifier) -> StoreResult<u64>;

    async fn table_exists(&self, table: &Identifier) -> StoreResult<bool>;

    async fn rename_table(&self, from: &Identifier, to: &Identifier) -> StoreResult<()>;

    async fn drop_table(&self, table: &Identifier) -> StoreResult<()>;

    /// Whether [`TableCatalog::swap_in`] can exchange staging and production
    /// with no window where production is absent
    fn supports_atomic_swap(&self) -> bool {
        false
    }

    /// Atomically rename production to retired (if present) and staging to
    /// production. Returns whether a production table was replaced.
    async fn swap_in(&self, _tables: &TableNames) -> StoreResult<bool> {
        Err(StoreError::Unsupported("atomic swap"))
    }
}
