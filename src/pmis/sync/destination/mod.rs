//! The destination database seen by the sync engine.

mod postgres;

pub use postgres::{MAX_BIND_PARAMS, PgDestination, effective_batch_size};

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::pmis::sync::error::Result;
use crate::pmis::sync::model::{NormalizedRecord, TableDescriptor, TypedValue};

/// Database operations the engine needs.
///
/// Every mutating call runs in its own transaction that is committed before
/// the call returns; on error nothing of that call remains.
#[async_trait]
pub trait Destination: Send {
    /// Reflects one table. Fails with `SchemaNotFound` when it does not exist.
    async fn describe_table(&mut self, table: &str) -> Result<TableDescriptor>;

    /// Every primary-key value currently stored, rendered as text.
    async fn existing_keys(&mut self, table: &TableDescriptor) -> Result<Vec<String>>;

    /// Marks the given keys deleted unless they already are. Returns the rows changed.
    async fn soft_delete(
        &mut self,
        table: &TableDescriptor,
        keys: &[TypedValue],
        at: NaiveDateTime,
    ) -> Result<u64>;

    /// Inserts the rows, updating existing ones on primary-key conflict.
    /// Returns the number of rows inserted or changed.
    async fn upsert_batch(
        &mut self,
        table: &TableDescriptor,
        columns: &[String],
        rows: &[NormalizedRecord],
    ) -> Result<u64>;

    /// Soft-deletes live rows of `child` whose `foreign_key` points at a
    /// soft-deleted row of `parent`. Returns the rows changed.
    async fn cascade_soft_delete(
        &mut self,
        child: &TableDescriptor,
        foreign_key: &str,
        parent: &TableDescriptor,
        at: NaiveDateTime,
    ) -> Result<u64>;

    /// Short name of the backend, for logs.
    fn db_type(&self) -> &str;
}
