use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::{ColumnValues, Result, Schema, SyncError};
use crate::store::change::Change;
use crate::store::filter::{Predicate, Select};
use crate::store::table::Table;
use crate::store::{CacheStore, StoreConnection};

struct StoreInner {
    /// Tables with individual locks
    tables: HashMap<String, Arc<RwLock<Table>>>,
    available: AtomicBool,
    next_connection_id: AtomicU64,
}

/// In-process cache store. Cloning yields another handle onto the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(schemas: Vec<Schema>) -> Result<Self> {
        let mut tables = HashMap::new();
        for schema in schemas {
            let name = schema.name().to_string();
            if tables.contains_key(&name) {
                return Err(SyncError::Persistence(format!("Table '{}' already exists", name)));
            }
            tables.insert(name, Arc::new(RwLock::new(Table::new(schema))));
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                tables,
                available: AtomicBool::new(true),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    /// Makes `connect` fail with a connection error while `false`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        let handle = self.inner.table(table)?;
        let guard = handle.read()?;
        Ok(guard.row_count())
    }

    pub fn open(&self) -> Result<MemoryConnection> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("cache store is unreachable".into()));
        }
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "cache store connection opened");
        Ok(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
            state: ConnectionState::Active,
            undo: Vec::new(),
        })
    }
}

impl StoreInner {
    fn table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::Persistence(format!("Table '{}' not found", name)))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        Ok(Box::new(self.open()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

pub struct MemoryConnection {
    id: u64,
    inner: Arc<StoreInner>,
    state: ConnectionState,
    undo: Vec<Change>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(SyncError::Connection(format!("connection {} is closed", self.id)));
        }
        Ok(())
    }

    fn record(&mut self, change: Change) {
        if self.state == ConnectionState::InTransaction {
            self.undo.push(change);
        }
    }

    fn undo_all(&mut self) -> Result<usize> {
        let count = self.undo.len();
        while let Some(change) = self.undo.pop() {
            let handle = self.inner.table(change.table_name())?;
            let mut table = handle.write()?;
            change.undo(&mut table);
        }
        Ok(count)
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    fn schema(&self, table: &str) -> Result<Arc<Schema>> {
        let handle = self.inner.table(table)?;
        let guard = handle.read()?;
        Ok(Arc::clone(guard.schema()))
    }

    async fn select(&mut self, query: &Select) -> Result<Vec<ColumnValues>> {
        self.ensure_open()?;
        let handle = self.inner.table(&query.table)?;
        let mut rows: Vec<ColumnValues> = {
            let table = handle.read()?;
            table.scan(&query.filter).into_iter().map(|(_, values)| values).collect()
        };
        query.sort(&mut rows);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&mut self, table_name: &str, values: &ColumnValues) -> Result<ColumnValues> {
        self.ensure_open()?;
        let handle = self.inner.table(table_name)?;
        let (row_id, stored) = {
            let mut table = handle.write()?;
            let (row_id, row) = table.insert(values)?;
            (row_id, table.to_values(&row))
        };
        self.record(Change::InsertRow { table: table_name.to_string(), row_id });
        Ok(stored)
    }

    async fn update(&mut self, table_name: &str, filter: &Predicate, values: &ColumnValues) -> Result<usize> {
        self.ensure_open()?;
        let handle = self.inner.table(table_name)?;
        let mut changes = Vec::new();
        let mut failure = None;
        {
            let mut table = handle.write()?;
            let ids: Vec<usize> = table.scan(filter).into_iter().map(|(id, _)| id).collect();
            for row_id in ids {
                match table.update(row_id, values) {
                    Ok(old_row) => {
                        changes.push(Change::UpdateRow { table: table_name.to_string(), row_id, old_row })
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        let affected = changes.len();
        changes.into_iter().for_each(|c| self.record(c));
        match failure {
            Some(e) => Err(e),
            None => Ok(affected),
        }
    }

    async fn delete(&mut self, table_name: &str, filter: &Predicate) -> Result<usize> {
        self.ensure_open()?;
        let handle = self.inner.table(table_name)?;
        let mut changes = Vec::new();
        {
            let mut table = handle.write()?;
            let ids: Vec<usize> = table.scan(filter).into_iter().map(|(id, _)| id).collect();
            for row_id in ids {
                if let Some(old_row) = table.delete(row_id) {
                    changes.push(Change::DeleteRow { table: table_name.to_string(), row_id, old_row });
                }
            }
        }
        let affected = changes.len();
        changes.into_iter().for_each(|c| self.record(c));
        Ok(affected)
    }

    async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == ConnectionState::InTransaction {
            return Err(SyncError::Persistence("transaction already in progress".into()));
        }
        self.state = ConnectionState::InTransaction;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(SyncError::Persistence("no transaction in progress".into()));
        }
        self.undo.clear();
        self.state = ConnectionState::Active;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state != ConnectionState::InTransaction {
            return Err(SyncError::Persistence("no transaction in progress".into()));
        }
        let undone = self.undo_all()?;
        debug!(connection = self.id, undone, "transaction rolled back");
        self.state = ConnectionState::Active;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.state == ConnectionState::InTransaction
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::InTransaction {
            self.undo_all()?;
        }
        self.state = ConnectionState::Closed;
        debug!(connection = self.id, "cache store connection closed");
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.state == ConnectionState::InTransaction {
            warn!(connection = self.id, pending = self.undo.len(), "connection dropped inside a transaction; rolling back");
            if let Err(e) = self.undo_all() {
                warn!(connection = self.id, error = %e, "rollback on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, Value};

    fn store() -> MemoryStore {
        MemoryStore::new(vec![Schema::new(
            "t",
            vec![
                Column::new("pk", DataType::Integer).primary_key(),
                Column::new("v", DataType::Text),
            ],
        )])
        .unwrap()
    }

    fn v(value: &str) -> ColumnValues {
        let mut values = ColumnValues::new();
        values.insert("v".into(), Value::from(value));
        values
    }

    #[tokio::test]
    async fn test_autocommit_writes_are_visible() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        let row = conn.insert("t", &v("a")).await.unwrap();
        assert_eq!(row.get("pk"), Some(&Value::Integer(1)));

        let mut other = store.connect().await.unwrap();
        let rows = other.select(&Select::from("t")).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_reverts_transaction() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        conn.insert("t", &v("kept")).await.unwrap();

        conn.begin().await.unwrap();
        conn.insert("t", &v("new")).await.unwrap();
        conn.update("t", &Predicate::eq("v", "kept"), &v("changed")).await.unwrap();
        conn.rollback().await.unwrap();

        let rows = conn.select(&Select::from("t")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&Value::from("kept")));
    }

    #[tokio::test]
    async fn test_drop_inside_transaction_rolls_back() {
        let store = store();
        {
            let mut conn = store.connect().await.unwrap();
            conn.begin().await.unwrap();
            conn.insert("t", &v("lost")).await.unwrap();
        }
        assert_eq!(store.row_count("t").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_refuses_connections() {
        let store = store();
        store.set_available(false);
        let err = store.connect().await.err().unwrap();
        assert_eq!(err.kind(), crate::core::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_queries() {
        let store = store();
        let mut conn = store.connect().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.select(&Select::from("t")).await.is_err());
    }
}
