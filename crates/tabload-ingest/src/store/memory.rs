//! In-process store for dry runs and tests
//!
//! Mirrors the Postgres backend's observable behaviour: natural-key dedup,
//! all-or-nothing batches, renames that fail on missing or occupied names.
//! Failure hooks let tests inject write errors, hung writes and failed
//! cutover steps.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{BatchSink, StoreError, StoreResult, TableCatalog};
use crate::schema::{Identifier, PartitionRoute, PartitionSchema, TableNames};
use crate::types::{NormalizedRecord, Value};

#[derive(Debug, Default, Clone)]
struct MemTable {
    rows: Vec<NormalizedRecord>,
    keys: HashSet<Vec<Value>>,
}

#[derive(Debug, Default)]
struct Hooks {
    write_delay: Duration,
    fail_renames_to: HashSet<String>,
    fail_drops: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemTable>>,
    hooks: Mutex<Hooks>,
    atomic_swap: bool,
    fail_writes: AtomicU32,
    hang_writes: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    insert_calls: AtomicUsize,
    truncated: AtomicBool,
}

/// Decrements the in-flight gauge even when the write future is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise and implement an atomic staging/production swap
    pub fn with_atomic_swap(mut self) -> Self {
        self.atomic_swap = true;
        self
    }

    pub async fn set_write_delay(&self, delay: Duration) {
        self.hooks.lock().await.write_delay = delay;
    }

    /// Make the next `n` insert calls fail
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` insert calls never complete
    pub fn hang_next_writes(&self, n: u32) {
        self.hang_writes.store(n, Ordering::SeqCst);
    }

    /// Fail any rename whose destination is `to`
    pub async fn fail_rename_to(&self, to: &Identifier) {
        self.hooks.lock().await.fail_renames_to.insert(to.to_string());
    }

    pub async fn fail_drop_of(&self, table: &Identifier) {
        self.hooks.lock().await.fail_drops.insert(table.to_string());
    }

    /// Create (or replace) a table holding `rows`, keyed by `schema`
    pub async fn seed_table(
        &self,
        table: &Identifier,
        schema: &PartitionSchema,
        rows: Vec<NormalizedRecord>,
    ) {
        let mut mem = MemTable::default();
        for row in rows {
            if let Some(key) = row.natural_key(schema) {
                if mem.keys.insert(key) {
                    mem.rows.push(row);
                }
            }
        }
        self.tables.lock().await.insert(table.to_string(), mem);
    }

    pub async fn rows(&self, table: &Identifier) -> Option<Vec<NormalizedRecord>> {
        self.tables
            .lock()
            .await
            .get(table.as_str())
            .map(|t| t.rows.clone())
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }

    /// Highest number of insert calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BatchSink for MemoryStore {
    async fn insert_batch(
        &self,
        table: &Identifier,
        schema: &PartitionSchema,
        rows: &[NormalizedRecord],
    ) -> StoreResult<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self.hooks.lock().await.write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if Self::take_one(&self.hang_writes) {
            std::future::pending::<()>().await;
        }
        if Self::take_one(&self.fail_writes) {
            return Err(StoreError::Rejected("injected write failure".into()));
        }

        let mut tables = self.tables.lock().await;
        let mem = tables
            .get_mut(table.as_str())
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.natural_key(schema).ok_or_else(|| {
                StoreError::Rejected(format!("row without natural key in {}", table))
            })?;
            keyed.push((key, row));
        }

        let mut inserted = 0;
        for (key, row) in keyed {
            if mem.keys.insert(key) {
                mem.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl TableCatalog for MemoryStore {
    async fn ensure_staging(&self, route: &PartitionRoute) -> StoreResult<()> {
        self.tables
            .lock()
            .await
            .entry(route.tables.staging.to_string())
            .or_default();
        Ok(())
    }

    async fn truncate(&self, table: &Identifier) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let mem = tables
            .get_mut(table.as_str())
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))?;
        *mem = MemTable::default();
        self.truncated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn count_rows(&self, table: &Identifier) -> StoreResult<u64> {
        self.tables
            .lock()
            .await
            .get(table.as_str())
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::TableMissing(table.to_string()))
    }

    async fn table_exists(&self, table: &Identifier) -> StoreResult<bool> {
        Ok(self.tables.lock().await.contains_key(table.as_str()))
    }

    async fn rename_table(&self, from: &Identifier, to: &Identifier) -> StoreResult<()> {
        if self.hooks.lock().await.fail_renames_to.contains(to.as_str()) {
            return Err(StoreError::Rejected(format!(
                "injected rename failure {} -> {}",
                from, to
            )));
        }

        let mut tables = self.tables.lock().await;
        if tables.contains_key(to.as_str()) {
            return Err(StoreError::TableExists(to.to_string()));
        }
        let mem = tables
            .remove(from.as_str())
            .ok_or_else(|| StoreError::TableMissing(from.to_string()))?;
        tables.insert(to.to_string(), mem);
        Ok(())
    }

    async fn drop_table(&self, table: &Identifier) -> StoreResult<()> {
        if self.hooks.lock().await.fail_drops.contains(table.as_str()) {
            return Err(StoreError::Rejected(format!("injected drop failure {}", table)));
        }
        self.tables.lock().await.remove(table.as_str());
        Ok(())
    }

    fn supports_atomic_swap(&self) -> bool {
        self.atomic_swap
    }

    async fn swap_in(&self, tables: &TableNames) -> StoreResult<bool> {
        if !self.atomic_swap {
            return Err(StoreError::Unsupported("atomic swap"));
        }

        let mut all = self.tables.lock().await;
        if !all.contains_key(tables.staging.as_str()) {
            return Err(StoreError::TableMissing(tables.staging.to_string()));
        }
        if all.contains_key(tables.retired.as_str()) {
            return Err(StoreError::TableExists(tables.retired.to_string()));
        }

        let previous = all.remove(tables.production.as_str());
        let replaced = previous.is_some();
        if let Some(previous) = previous {
            all.insert(tables.retired.to_string(), previous);
        }
        if let Some(staged) = all.remove(tables.staging.as_str()) {
            all.insert(tables.production.to_string(), staged);
        }
        Ok(replaced)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};

    fn schema() -> PartitionSchema {
        PartitionSchema::new(
            vec![FieldSpec::new("id", FieldType::Integer)],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn row(id: i64) -> NormalizedRecord {
        let mut r = NormalizedRecord::new();
        r.insert("id", Value::Integer(id));
        r
    }

    #[tokio::test]
    async fn test_insert_skips_existing_keys() {
        let store = MemoryStore::new();
        let table = Identifier::new("t").unwrap();
        store.seed_table(&table, &schema(), vec![]).await;

        assert_eq!(store.insert_batch(&table, &schema(), &[row(1), row(2)]).await.unwrap(), 2);
        assert_eq!(store.insert_batch(&table, &schema(), &[row(2), row(3)]).await.unwrap(), 1);
        assert_eq!(store.count_rows(&table).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let table = Identifier::new("t").unwrap();
        store.seed_table(&table, &schema(), vec![]).await;
        store.fail_next_writes(1);

        assert!(store.insert_batch(&table, &schema(), &[row(1)]).await.is_err());
        assert!(store.insert_batch(&table, &schema(), &[row(1)]).await.is_ok());
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_rename_refuses_occupied_name() {
        let store = MemoryStore::new();
        let a = Identifier::new("a").unwrap();
        let b = Identifier::new("b").unwrap();
        store.seed_table(&a, &schema(), vec![]).await;
        store.seed_table(&b, &schema(), vec![]).await;

        assert!(matches!(
            store.rename_table(&a, &b).await.unwrap_err(),
            StoreError::TableExists(_)
        ));
    }

    #[tokio::test]
    async fn test_swap_requires_opt_in() {
        let store = MemoryStore::new();
        let tables = TableNames::for_partition("voter", "CA").unwrap();
        assert!(!store.supports_atomic_swap());
        assert!(matches!(
            store.swap_in(&tables).await.unwrap_err(),
            StoreError::Unsupported(_)
        ));
    }
}
