//! # In-Memory Store
//!
//! Process-local store used by tests and dry runs. Sessions see committed
//! rows plus their own pending writes; commit applies the write log under a
//! single lock. Row and table locks are async mutexes owned by the session
//! until it ends.

use crate::errors::{Result, RouteplaneError};
use crate::storage::record::{Record, RecordFilter};
use dashmap::DashMap;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

type Tables = HashMap<&'static str, Box<dyn Any + Send + Sync>>;
type WriteOp = Arc<dyn Fn(&mut Tables) + Send + Sync>;

/// Shared state of the in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("locks", &self.locks.len()).finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            writes: Vec::new(),
            guards: Vec::new(),
            held: HashSet::new(),
        }
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handle(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }
}

fn rows_mut<R: Record>(tables: &mut Tables) -> Option<&mut Vec<R>> {
    tables
        .entry(R::TABLE)
        .or_insert_with(|| Box::new(Vec::<R>::new()))
        .downcast_mut::<Vec<R>>()
}

/// Unit of work against a [`MemoryStore`]
pub struct MemorySession {
    store: MemoryStore,
    writes: Vec<(&'static str, WriteOp)>,
    guards: Vec<OwnedMutexGuard<()>>,
    held: HashSet<String>,
}

impl MemorySession {
    /// Committed rows of `R` with this session's pending writes applied
    fn view<R: Record>(&self) -> Vec<R> {
        let committed = {
            let tables = self.store.lock_tables();
            tables
                .get(R::TABLE)
                .and_then(|rows| rows.downcast_ref::<Vec<R>>())
                .cloned()
                .unwrap_or_default()
        };

        let mut scratch: Tables = HashMap::new();
        scratch.insert(R::TABLE, Box::new(committed));
        for (table, op) in &self.writes {
            if *table == R::TABLE {
                op(&mut scratch);
            }
        }
        scratch
            .remove(R::TABLE)
            .and_then(|rows| rows.downcast::<Vec<R>>().ok())
            .map(|rows| *rows)
            .unwrap_or_default()
    }

    fn push_write<R: Record>(&mut self, op: impl Fn(&mut Vec<R>) + Send + Sync + 'static) {
        let op: WriteOp = Arc::new(move |tables: &mut Tables| {
            if let Some(rows) = rows_mut::<R>(tables) {
                op(rows);
            }
        });
        self.writes.push((R::TABLE, op));
    }

    async fn acquire(&mut self, key: String) {
        if self.held.contains(&key) {
            return;
        }
        let handle = self.store.lock_handle(&key);
        let guard = handle.lock_owned().await;
        self.guards.push(guard);
        self.held.insert(key);
    }

    pub fn get<R: Record>(&self, id: &R::Id) -> Option<R> {
        self.view::<R>().into_iter().find(|row| row.id() == id)
    }

    pub fn select<R: Record>(&self, filter: &R::Filter) -> Vec<R> {
        self.view::<R>().into_iter().filter(|row| filter.matches(row)).collect()
    }

    pub async fn select_for_update<R: Record>(&mut self, filter: &R::Filter) -> Vec<R> {
        let mut keys: Vec<String> = self
            .select::<R>(filter)
            .iter()
            .map(|row| format!("{}:{}", R::TABLE, row.id()))
            .collect();
        keys.sort();
        for key in keys {
            self.acquire(key).await;
        }
        // rows may have changed while waiting
        self.select::<R>(filter)
    }

    pub async fn lock_table<R: Record>(&mut self) {
        self.acquire(format!("table:{}", R::TABLE)).await;
    }

    pub fn insert<R: Record>(&mut self, record: &R) -> Result<()> {
        if self.get::<R>(record.id()).is_some() {
            return Err(RouteplaneError::conflict(
                format!("{} with id '{}' already exists", R::TABLE, record.id()),
                R::TABLE,
            ));
        }
        let record = record.clone();
        self.push_write::<R>(move |rows| rows.push(record.clone()));
        Ok(())
    }

    pub fn update<R: Record>(&mut self, record: &R) -> Result<()> {
        if self.get::<R>(record.id()).is_none() {
            return Err(RouteplaneError::not_found(R::TABLE, record.id().to_string()));
        }
        let record = record.clone();
        self.push_write::<R>(move |rows| {
            if let Some(row) = rows.iter_mut().find(|row| row.id() == record.id()) {
                *row = record.clone();
            }
        });
        Ok(())
    }

    pub fn delete<R: Record>(&mut self, filter: &R::Filter) -> u64 {
        let ids: Vec<R::Id> = self.select::<R>(filter).iter().map(|row| row.id().clone()).collect();
        let count = ids.len() as u64;
        if count > 0 {
            self.push_write::<R>(move |rows| rows.retain(|row| !ids.contains(row.id())));
        }
        count
    }

    pub fn delete_by_id<R: Record>(&mut self, id: &R::Id) -> u64 {
        if self.get::<R>(id).is_none() {
            return 0;
        }
        let id = id.clone();
        self.push_write::<R>(move |rows| rows.retain(|row| row.id() != &id));
        1
    }

    /// Apply the write log atomically and release locks
    pub fn commit(mut self) {
        {
            let mut tables = self.store.lock_tables();
            for (_, op) in self.writes.drain(..) {
                op(&mut *tables);
            }
        }
        self.guards.clear();
    }

    /// Discard the write log and release locks
    pub fn rollback(mut self) {
        self.writes.clear();
        self.guards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::*;
    use crate::storage::tables::ConsumerFilter;
    use chrono::Utc;
    use std::time::Duration;

    fn consumer(name: &str) -> Consumer {
        Consumer {
            id: ConsumerId::new(),
            name: name.to_string(),
            backend_id: String::new(),
            org_id: "1".to_string(),
            project_id: "2".to_string(),
            env: "DEV".to_string(),
            az: "dev".to_string(),
            is_default: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let store = MemoryStore::new();
        let mut writer = store.begin();
        writer.insert(&consumer("a")).unwrap();

        let reader = store.begin();
        assert_eq!(writer.select::<Consumer>(&ConsumerFilter::default()).len(), 1);
        assert!(reader.select::<Consumer>(&ConsumerFilter::default()).is_empty());

        writer.commit();
        assert_eq!(reader.select::<Consumer>(&ConsumerFilter::default()).len(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut session = store.begin();
        session.insert(&consumer("a")).unwrap();
        session.rollback();

        assert!(store.begin().select::<Consumer>(&ConsumerFilter::default()).is_empty());
    }

    #[test]
    fn update_and_delete_apply_in_order() {
        let store = MemoryStore::new();
        let mut session = store.begin();
        let mut row = consumer("a");
        session.insert(&row).unwrap();
        row.backend_id = "kong-1".to_string();
        session.update(&row).unwrap();
        session.insert(&consumer("b")).unwrap();
        let removed = session.delete::<Consumer>(&ConsumerFilter {
            name: Some("b".to_string()),
            ..Default::default()
        });
        assert_eq!(removed, 1);
        session.commit();

        let rows = store.begin().select::<Consumer>(&ConsumerFilter::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].backend_id, "kong-1");
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        let mut session = store.begin();
        let row = consumer("a");
        session.insert(&row).unwrap();
        assert!(matches!(session.insert(&row), Err(RouteplaneError::Conflict { .. })));
    }

    #[tokio::test]
    async fn row_lock_blocks_second_session_until_commit() {
        let store = MemoryStore::new();
        let mut setup = store.begin();
        setup.insert(&consumer("a")).unwrap();
        setup.commit();

        let mut first = store.begin();
        let locked = first.select_for_update::<Consumer>(&ConsumerFilter::default()).await;
        assert_eq!(locked.len(), 1);

        let second_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = second_store.begin();
            second.select_for_update::<Consumer>(&ConsumerFilter::default()).await[0]
                .backend_id
                .clone()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let mut row = locked[0].clone();
        row.backend_id = "updated".to_string();
        first.update(&row).unwrap();
        first.commit();

        assert_eq!(waiter.await.unwrap(), "updated");
    }
}
