//! # Record and Filter Traits
//!
//! Every persisted table implements [`Record`]; its filterable fields are
//! listed explicitly by a [`RecordFilter`] struct. A filter field set to
//! `None` is not part of the condition. `Some(v)` must match exactly, which
//! includes empty strings and `false`.

use sqlx::postgres::{PgRow, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{Encode, FromRow, QueryBuilder, Type};
use std::fmt::Display;

/// A row of one table of the system of record
pub trait Record:
    Clone + std::fmt::Debug + Send + Sync + Unpin + 'static + for<'r> FromRow<'r, PgRow>
{
    /// Table name
    const TABLE: &'static str;

    /// Column names in the order `push_values` binds them
    const COLUMNS: &'static [&'static str];

    /// Primary key type
    type Id: Clone
        + PartialEq
        + Display
        + Send
        + Sync
        + 'static
        + for<'q> Encode<'q, Postgres>
        + Type<Postgres>;

    /// Condition spec accepted by selects and deletes
    type Filter: RecordFilter<Self> + Default + Send + Sync;

    fn id(&self) -> &Self::Id;

    /// Bind every column value, in `COLUMNS` order
    fn push_values<'args>(&self, row: &mut Separated<'_, 'args, Postgres, &'static str>);

    /// Comma-joined column list for SELECT/INSERT
    fn column_list() -> String {
        Self::COLUMNS.join(", ")
    }
}

/// Explicit condition over the fields of a record
pub trait RecordFilter<R> {
    /// Evaluate the condition in memory
    fn matches(&self, record: &R) -> bool;

    /// Append ` WHERE ...` for the set fields
    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>);
}

/// Declare a filter struct for a record.
///
/// Scalar fields compare with `=`; fields listed under `in` hold a set of
/// values compared with `= ANY(...)`.
macro_rules! record_filter {
    (
        $(#[$meta:meta])*
        $name:ident for $record:ty {
            $($field:ident: $ty:ty),* $(,)?
        }
        $(in { $($set:ident => $col:ident: $sty:ty),* $(,)? })?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name {
            $(pub $field: Option<$ty>,)*
            $($(pub $set: Option<Vec<$sty>>,)*)?
        }

        impl $crate::storage::record::RecordFilter<$record> for $name {
            fn matches(&self, record: &$record) -> bool {
                $(
                    if let Some(value) = &self.$field {
                        if &record.$field != value {
                            return false;
                        }
                    }
                )*
                $($(
                    if let Some(values) = &self.$set {
                        if !values.contains(&record.$col) {
                            return false;
                        }
                    }
                )*)?
                true
            }

            fn push_where(&self, qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>) {
                qb.push(" WHERE TRUE");
                $(
                    if let Some(value) = &self.$field {
                        qb.push(concat!(" AND ", stringify!($field), " = "));
                        qb.push_bind(value.clone());
                    }
                )*
                $($(
                    if let Some(values) = &self.$set {
                        qb.push(concat!(" AND ", stringify!($col), " = ANY("));
                        qb.push_bind(values.clone());
                        qb.push(")");
                    }
                )*)?
            }
        }
    };
}

/// Implement [`Record`] for a model whose primary key field is `id`
macro_rules! impl_record {
    ($record:ty, table = $table:literal, id = $id:ty, filter = $filter:ty, [$($col:ident),+ $(,)?]) => {
        impl $crate::storage::record::Record for $record {
            const TABLE: &'static str = $table;
            const COLUMNS: &'static [&'static str] = &[$(stringify!($col)),+];
            type Id = $id;
            type Filter = $filter;

            fn id(&self) -> &Self::Id {
                &self.id
            }

            fn push_values<'args>(
                &self,
                row: &mut sqlx::query_builder::Separated<'_, 'args, sqlx::Postgres, &'static str>,
            ) {
                $(row.push_bind(self.$col.clone());)+
            }
        }
    };
}

pub(crate) use impl_record;
pub(crate) use record_filter;
