//! # Store and Session
//!
//! A [`Session`] is one unit of work: reads, writes, row locks and an
//! explicit commit or rollback. Dropping a session without committing rolls
//! it back.

use crate::config::DatabaseConfig;
use crate::errors::{Result, RouteplaneError};
use crate::storage::memory::{MemorySession, MemoryStore};
use crate::storage::pool::{create_pool, DbPool};
use crate::storage::record::{Record, RecordFilter};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::instrument;

/// Handle to the system of record
#[derive(Debug, Clone)]
pub enum Store {
    Postgres(DbPool),
    Memory(MemoryStore),
}

impl Store {
    /// Open the store selected by the database URL
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.is_memory() {
            tracing::info!("Using in-memory store");
            return Ok(Self::memory());
        }
        Ok(Self::Postgres(create_pool(config).await?))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Start a new unit of work
    pub async fn begin(&self) -> Result<Session> {
        let inner = match self {
            Store::Postgres(pool) => {
                let tx = pool.begin().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to begin transaction");
                    RouteplaneError::database(e, "Failed to begin transaction")
                })?;
                SessionInner::Postgres(tx)
            }
            Store::Memory(store) => SessionInner::Memory(store.begin()),
        };
        Ok(Session { inner })
    }
}

enum SessionInner {
    Postgres(Transaction<'static, Postgres>),
    Memory(MemorySession),
}

/// One relational unit of work
pub struct Session {
    inner: SessionInner,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            SessionInner::Postgres(_) => "postgres",
            SessionInner::Memory(_) => "memory",
        };
        f.debug_struct("Session").field("kind", &kind).finish()
    }
}

fn select_sql<R: Record>() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("SELECT {} FROM {}", R::column_list(), R::TABLE))
}

fn db_error<R: Record>(e: sqlx::Error, action: &str) -> RouteplaneError {
    tracing::error!(error = %e, table = R::TABLE, action, "Database operation failed");
    RouteplaneError::database(e, format!("Failed to {} {}", action, R::TABLE))
}

impl Session {
    /// Fetch a row by primary key
    #[instrument(skip(self, id), fields(table = R::TABLE), name = "db_get")]
    pub async fn get<R: Record>(&mut self, id: &R::Id) -> Result<Option<R>> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = select_sql::<R>();
                qb.push(" WHERE id = ").push_bind(id.clone());
                qb.build_query_as::<R>()
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "get"))
            }
            SessionInner::Memory(session) => Ok(session.get::<R>(id)),
        }
    }

    /// Fetch a row by primary key, failing with `NotFound` when absent
    pub async fn must_get<R: Record>(&mut self, id: &R::Id) -> Result<R> {
        self.get::<R>(id)
            .await?
            .ok_or_else(|| RouteplaneError::not_found(R::TABLE, id.to_string()))
    }

    /// First row matching the filter, in creation order
    pub async fn get_by<R: Record>(&mut self, filter: &R::Filter) -> Result<Option<R>> {
        Ok(self.select::<R>(filter).await?.into_iter().next())
    }

    /// All rows matching the filter, in creation order
    #[instrument(skip(self, filter), fields(table = R::TABLE), name = "db_select")]
    pub async fn select<R: Record>(&mut self, filter: &R::Filter) -> Result<Vec<R>> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = select_sql::<R>();
                filter.push_where(&mut qb);
                qb.push(" ORDER BY created_at, id");
                qb.build_query_as::<R>()
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "select"))
            }
            SessionInner::Memory(session) => Ok(session.select::<R>(filter)),
        }
    }

    /// Select and row-lock every matching row until the session ends
    #[instrument(skip(self, filter), fields(table = R::TABLE), name = "db_select_for_update")]
    pub async fn select_for_update<R: Record>(&mut self, filter: &R::Filter) -> Result<Vec<R>> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = select_sql::<R>();
                filter.push_where(&mut qb);
                qb.push(" ORDER BY created_at, id FOR UPDATE");
                qb.build_query_as::<R>()
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "lock rows of"))
            }
            SessionInner::Memory(session) => Ok(session.select_for_update::<R>(filter).await),
        }
    }

    /// Take a table lock that conflicts with other table lockers and writers
    #[instrument(skip(self), fields(table = R::TABLE), name = "db_lock_table")]
    pub async fn lock_table<R: Record>(&mut self) -> Result<()> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let sql = format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", R::TABLE);
                sqlx::query(&sql)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "lock"))?;
                Ok(())
            }
            SessionInner::Memory(session) => {
                session.lock_table::<R>().await;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, record), fields(table = R::TABLE, id = %record.id()), name = "db_insert")]
    pub async fn insert<R: Record>(&mut self, record: &R) -> Result<()> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = QueryBuilder::<Postgres>::new(format!(
                    "INSERT INTO {} ({}) ",
                    R::TABLE,
                    R::column_list()
                ));
                qb.push_values(std::iter::once(record), |mut row, record| {
                    record.push_values(&mut row);
                });
                qb.build()
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| map_insert_error::<R>(e, record))?;
                Ok(())
            }
            SessionInner::Memory(session) => session.insert(record),
        }
    }

    /// Overwrite every column of an existing row
    #[instrument(skip(self, record), fields(table = R::TABLE, id = %record.id()), name = "db_update")]
    pub async fn update<R: Record>(&mut self, record: &R) -> Result<()> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = QueryBuilder::<Postgres>::new(format!(
                    "UPDATE {} SET ({}) = ROW(",
                    R::TABLE,
                    R::column_list()
                ));
                {
                    let mut row = qb.separated(", ");
                    record.push_values(&mut row);
                    row.push_unseparated(")");
                }
                qb.push(" WHERE id = ").push_bind(record.id().clone());
                let result = qb
                    .build()
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "update"))?;
                if result.rows_affected() == 0 {
                    return Err(RouteplaneError::not_found(R::TABLE, record.id().to_string()));
                }
                Ok(())
            }
            SessionInner::Memory(session) => session.update(record),
        }
    }

    /// Delete every row matching the filter, returning how many went
    #[instrument(skip(self, filter), fields(table = R::TABLE), name = "db_delete")]
    pub async fn delete<R: Record>(&mut self, filter: &R::Filter) -> Result<u64> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = QueryBuilder::<Postgres>::new(format!("DELETE FROM {}", R::TABLE));
                filter.push_where(&mut qb);
                let result = qb
                    .build()
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "delete from"))?;
                Ok(result.rows_affected())
            }
            SessionInner::Memory(session) => Ok(session.delete::<R>(filter)),
        }
    }

    #[instrument(skip(self, id), fields(table = R::TABLE, id = %id), name = "db_delete_by_id")]
    pub async fn delete_by_id<R: Record>(&mut self, id: &R::Id) -> Result<u64> {
        match &mut self.inner {
            SessionInner::Postgres(tx) => {
                let mut qb = QueryBuilder::<Postgres>::new(format!("DELETE FROM {}", R::TABLE));
                qb.push(" WHERE id = ").push_bind(id.clone());
                let result = qb
                    .build()
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| db_error::<R>(e, "delete from"))?;
                Ok(result.rows_affected())
            }
            SessionInner::Memory(session) => Ok(session.delete_by_id::<R>(id)),
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self.inner {
            SessionInner::Postgres(tx) => tx.commit().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to commit transaction");
                RouteplaneError::database(e, "Failed to commit transaction")
            }),
            SessionInner::Memory(session) => {
                session.commit();
                Ok(())
            }
        }
    }

    pub async fn rollback(self) -> Result<()> {
        match self.inner {
            SessionInner::Postgres(tx) => tx.rollback().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to roll back transaction");
                RouteplaneError::database(e, "Failed to roll back transaction")
            }),
            SessionInner::Memory(session) => {
                session.rollback();
                Ok(())
            }
        }
    }
}

fn map_insert_error<R: Record>(e: sqlx::Error, record: &R) -> RouteplaneError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return RouteplaneError::conflict(
                format!("{} row '{}' violates a uniqueness constraint", R::TABLE, record.id()),
                R::TABLE,
            );
        }
    }
    db_error::<R>(e, "insert into")
}
