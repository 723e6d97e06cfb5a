pub mod change;
pub mod filter;
pub mod memory;
pub mod table;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{ColumnValues, Result, Schema};

pub use change::Change;
pub use filter::{Predicate, Select, SortOrder};
pub use memory::{MemoryConnection, MemoryStore};
pub use table::Table;

/// A cache store that hands out independent connections.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>>;
}

/// One connection to the cache store.
///
/// Outside of `begin`/`commit` every write is applied immediately. Inside a transaction,
/// `rollback` (or dropping the connection) reverts all writes since `begin`.
#[async_trait]
pub trait StoreConnection: Send {
    fn schema(&self, table: &str) -> Result<Arc<Schema>>;

    async fn select(&mut self, query: &Select) -> Result<Vec<ColumnValues>>;

    /// Inserts one row and returns the stored values, generated key included.
    async fn insert(&mut self, table: &str, values: &ColumnValues) -> Result<ColumnValues>;

    /// Returns the number of affected rows.
    async fn update(&mut self, table: &str, filter: &Predicate, values: &ColumnValues) -> Result<usize>;

    async fn delete(&mut self, table: &str, filter: &Predicate) -> Result<usize>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}
