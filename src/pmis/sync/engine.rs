//! Drives a full synchronisation run.

use std::path::Path;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::pmis::sync::cascade::{CascadeOutcome, run_cascade};
use crate::pmis::sync::config::SyncOptions;
use crate::pmis::sync::destination::Destination;
use crate::pmis::sync::error::Result;
use crate::pmis::sync::io::excel_read;
use crate::pmis::sync::model::SourceWorkbook;
use crate::pmis::sync::plan::plan_table;
use crate::pmis::sync::schema::SchemaRegistry;
use crate::pmis::sync::upsert::{TableOutcome, apply_plan};

/// A configured table that was not processed, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub started_at: NaiveDateTime,
    pub dry_run: bool,
    pub tables: Vec<TableOutcome>,
    pub skipped: Vec<SkippedTable>,
    /// Sheets that match no configured table.
    pub unknown_sheets: Vec<String>,
    pub cascades: Vec<CascadeOutcome>,
}

impl SyncReport {
    fn new(started_at: NaiveDateTime, dry_run: bool) -> Self {
        Self {
            started_at,
            dry_run,
            tables: Vec::new(),
            skipped: Vec::new(),
            unknown_sheets: Vec::new(),
            cascades: Vec::new(),
        }
    }

    fn skip(&mut self, table: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedTable {
            table: table.to_string(),
            reason: reason.into(),
        });
    }

    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|outcome| outcome.table == name)
    }

    pub fn rows_upserted(&self) -> u64 {
        self.tables.iter().map(|outcome| outcome.upserted).sum()
    }

    pub fn rows_soft_deleted(&self) -> u64 {
        self.tables.iter().map(|outcome| outcome.soft_deleted).sum()
    }

    pub fn rows_cascaded(&self) -> u64 {
        self.cascades.iter().map(|outcome| outcome.cascaded).sum()
    }

    /// Tables that had at least one failed phase or batch.
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|outcome| !outcome.succeeded())
            .map(|outcome| outcome.table.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs one synchronisation of the workbook at `source` into `destination`.
///
/// Only schema reflection, source loading and a lost connection can fail the
/// run. Failures of a single table, batch or cascade rule are logged and
/// recorded in the report.
#[instrument(
    level = "info",
    skip_all,
    fields(source = %source.display(), db = destination.db_type(), dry_run = dry_run)
)]
pub async fn run_sync<D>(
    destination: &mut D,
    source: &Path,
    options: &SyncOptions,
    dry_run: bool,
) -> Result<SyncReport>
where
    D: Destination + ?Sized,
{
    let run_started = Local::now().naive_local();
    run_sync_at(destination, source, options, dry_run, run_started).await
}

/// [`run_sync`] with an explicit run timestamp.
pub async fn run_sync_at<D>(
    destination: &mut D,
    source: &Path,
    options: &SyncOptions,
    dry_run: bool,
    run_started: NaiveDateTime,
) -> Result<SyncReport>
where
    D: Destination + ?Sized,
{
    info!(tables = options.tables.len(), "synchronisation started");
    for rule in options.unlisted_cascade_rules() {
        warn!(%rule, "cascade rule names a table outside the processing order");
    }

    let registry = SchemaRegistry::reflect(destination, &options.tables_to_reflect()).await?;
    if registry.is_empty() {
        warn!("no configured table exists in the destination");
    }
    let workbook = excel_read::read_workbook(source)?;
    info!(sheets = workbook.len(), "source workbook loaded");

    let mut report = SyncReport::new(run_started, dry_run);
    report.unknown_sheets = unknown_sheets(&workbook, options);
    for sheet in &report.unknown_sheets {
        warn!(sheet = %sheet, "sheet matches no configured table, ignored");
    }

    for table in &options.tables {
        let descriptor = match registry.get(table) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let reason = registry
                    .missing()
                    .get(table)
                    .cloned()
                    .unwrap_or_else(|| err.to_string());
                report.skip(table, reason);
                continue;
            }
        };
        let Some(sheet) = workbook.get(table) else {
            debug!(table = %table, "no sheet for table");
            report.skip(table, "no sheet in source workbook");
            continue;
        };
        if sheet.is_empty() {
            info!(table = %table, "sheet has no data rows, table left untouched");
            report.skip(table, "sheet has no data rows");
            continue;
        }

        let plan = match plan_table(destination, descriptor, sheet, run_started).await {
            Ok(plan) => plan,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!(table = %table, error = %err, "table could not be planned");
                report.tables.push(TableOutcome::failed(table, &err));
                continue;
            }
        };

        let outcome = if dry_run {
            info!(
                table = %table,
                upserts = plan.rows_to_upsert.len(),
                soft_deletes = plan.ids_to_soft_delete.len(),
                rejected = plan.rejected_rows,
                "dry run, nothing written"
            );
            TableOutcome::from_plan(&plan)
        } else {
            apply_plan(destination, descriptor, &plan, options.batch_size, run_started).await
        };
        report.tables.push(outcome);
    }

    if dry_run {
        info!("dry run, cascade skipped");
    } else {
        report.cascades = run_cascade(destination, &registry, &options.cascade, run_started).await;
    }

    info!(
        upserted = report.rows_upserted(),
        soft_deleted = report.rows_soft_deleted(),
        cascaded = report.rows_cascaded(),
        failed_tables = report.failed_tables().len(),
        "synchronisation finished"
    );
    Ok(report)
}

fn unknown_sheets(workbook: &SourceWorkbook, options: &SyncOptions) -> Vec<String> {
    workbook
        .keys()
        .filter(|sheet| !options.tables.contains(sheet))
        .cloned()
        .collect()
}
