//! Applies a table's plan: soft deletes first, then batched upserts.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::pmis::sync::destination::{Destination, effective_batch_size};
use crate::pmis::sync::error::SyncError;
use crate::pmis::sync::model::TableDescriptor;
use crate::pmis::sync::plan::SyncPlan;

/// What happened to one table during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub planned_upserts: usize,
    pub planned_soft_deletes: usize,
    pub soft_deleted: u64,
    pub upserted: u64,
    pub rejected_rows: usize,
    pub degraded_fields: usize,
    pub duplicate_keys: usize,
    /// Zero-based indices of batches that were rolled back.
    pub failed_batches: Vec<usize>,
    pub errors: Vec<String>,
}

impl TableOutcome {
    pub fn from_plan(plan: &SyncPlan) -> Self {
        Self {
            table: plan.table.clone(),
            planned_upserts: plan.rows_to_upsert.len(),
            planned_soft_deletes: plan.ids_to_soft_delete.len(),
            rejected_rows: plan.rejected_rows,
            degraded_fields: plan.degraded_fields,
            duplicate_keys: plan.duplicate_keys,
            ..Self::default()
        }
    }

    /// A table-level failure that prevented planning.
    pub fn failed(table: impl Into<String>, err: &SyncError) -> Self {
        Self {
            table: table.into(),
            errors: vec![err.to_string()],
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.failed_batches.is_empty()
    }
}

/// Applies `plan` to the destination.
///
/// Each phase and each batch commits on its own. A failing batch is rolled
/// back and logged, and the remaining batches still run.
#[instrument(level = "info", skip_all, fields(table = %descriptor.name))]
pub async fn apply_plan<D>(
    destination: &mut D,
    descriptor: &TableDescriptor,
    plan: &SyncPlan,
    batch_size: usize,
    run_started: NaiveDateTime,
) -> TableOutcome
where
    D: Destination + ?Sized,
{
    let mut outcome = TableOutcome::from_plan(plan);

    if !plan.ids_to_soft_delete.is_empty() {
        if descriptor.supports_soft_delete() {
            let keys: Vec<_> = plan.ids_to_soft_delete.iter().cloned().collect();
            match destination.soft_delete(descriptor, &keys, run_started).await {
                Ok(affected) => outcome.soft_deleted = affected,
                Err(err) => {
                    error!(table = %descriptor.name, error = %err, "soft delete rolled back");
                    outcome.errors.push(format!("soft delete: {err}"));
                }
            }
        } else {
            warn!(
                table = %descriptor.name,
                rows = plan.ids_to_soft_delete.len(),
                "table lacks bookkeeping columns, soft delete skipped"
            );
            outcome
                .errors
                .push("soft delete skipped: missing is_deleted/last_updated".to_string());
        }
    }

    let batch_size = effective_batch_size(batch_size, plan.columns.len());
    for (batch, rows) in plan.rows_to_upsert.chunks(batch_size).enumerate() {
        match destination
            .upsert_batch(descriptor, &plan.columns, rows)
            .await
        {
            Ok(affected) => outcome.upserted += affected,
            Err(err) => {
                let err = SyncError::batch_write(&descriptor.name, batch, err);
                error!(table = %descriptor.name, batch, rows = rows.len(), error = %err, "batch rolled back");
                outcome.failed_batches.push(batch);
                outcome.errors.push(err.to_string());
            }
        }
    }

    info!(
        table = %descriptor.name,
        soft_deleted = outcome.soft_deleted,
        upserted = outcome.upserted,
        rejected = outcome.rejected_rows,
        failed_batches = outcome.failed_batches.len(),
        "table synchronised"
    );
    outcome
}
