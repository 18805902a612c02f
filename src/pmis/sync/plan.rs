//! Per-table reconciliation plans.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use tracing::{debug, instrument, warn};

use crate::pmis::sync::destination::Destination;
use crate::pmis::sync::error::{Result, SyncError};
use crate::pmis::sync::model::{
    IS_DELETED, LAST_UPDATED, NormalizedRecord, RawValue, SourceSheet, TableDescriptor,
    TypedValue,
};
use crate::pmis::sync::normalize::{RowNormalizer, coerce};

/// What one table needs so the destination matches its sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub table: String,
    /// Columns written by the upsert, in destination order.
    pub columns: Vec<String>,
    pub rows_to_upsert: Vec<NormalizedRecord>,
    /// Keys stored in the destination that the sheet no longer has.
    pub ids_to_soft_delete: BTreeSet<TypedValue>,
    /// Rows dropped because their primary key could not be resolved.
    pub rejected_rows: usize,
    /// Fields stored as null because they could not be typed.
    pub degraded_fields: usize,
    /// Rows superseded by a later row with the same key.
    pub duplicate_keys: usize,
}

/// Reads the destination's keys for `descriptor` and plans the table.
#[instrument(level = "debug", skip_all, fields(table = %descriptor.name))]
pub async fn plan_table<D>(
    destination: &mut D,
    descriptor: &TableDescriptor,
    sheet: &SourceSheet,
    run_started: NaiveDateTime,
) -> Result<SyncPlan>
where
    D: Destination + ?Sized,
{
    if !sheet.has_column(&descriptor.primary_key) {
        return Err(missing_key_column(descriptor));
    }
    let existing = destination.existing_keys(descriptor).await?;
    build_plan(descriptor, sheet, &existing, run_started)
}

fn missing_key_column(descriptor: &TableDescriptor) -> SyncError {
    SyncError::MissingKeyColumn {
        table: descriptor.name.clone(),
        column: descriptor.primary_key.clone(),
    }
}

/// Plans a table from its sheet and the keys currently stored.
///
/// `existing_keys` are the destination's key values as text; they are typed
/// with the key column's rule so they compare equal to the sheet's keys.
pub fn build_plan(
    descriptor: &TableDescriptor,
    sheet: &SourceSheet,
    existing_keys: &[String],
    run_started: NaiveDateTime,
) -> Result<SyncPlan> {
    let key_column = descriptor
        .key_column()
        .ok_or_else(|| SyncError::NoPrimaryKey(descriptor.name.clone()))?;
    if !sheet.has_column(&descriptor.primary_key) {
        return Err(missing_key_column(descriptor));
    }

    let normalizer = RowNormalizer::new(descriptor, &sheet.columns, run_started);
    let mut rows_to_upsert: Vec<NormalizedRecord> = Vec::with_capacity(sheet.rows.len());
    let mut positions: HashMap<TypedValue, usize> = HashMap::new();
    let mut rejected_rows = 0;
    let mut degraded_fields = 0;
    let mut duplicate_keys = 0;

    for (index, raw) in sheet.rows.iter().enumerate() {
        match normalizer.normalize(raw) {
            Ok(row) => {
                degraded_fields += row.degraded_fields;
                match positions.get(&row.record.key) {
                    Some(&position) => {
                        duplicate_keys += 1;
                        rows_to_upsert[position] = row.record;
                    }
                    None => {
                        positions.insert(row.record.key.clone(), rows_to_upsert.len());
                        rows_to_upsert.push(row.record);
                    }
                }
            }
            Err(reason) => {
                rejected_rows += 1;
                // Sheet rows are 1-based and the header takes the first.
                warn!(table = %descriptor.name, row = index + 2, %reason, "row rejected");
            }
        }
    }

    if duplicate_keys > 0 {
        warn!(
            table = %descriptor.name,
            duplicates = duplicate_keys,
            "duplicate primary keys in sheet, the last occurrence wins"
        );
    }

    let mut ids_to_soft_delete = BTreeSet::new();
    for text in existing_keys {
        match coerce(&RawValue::Text(text.clone()), key_column) {
            Ok(TypedValue::Null) => {}
            Ok(key) => {
                if !positions.contains_key(&key) {
                    ids_to_soft_delete.insert(key);
                }
            }
            Err(err) => {
                warn!(table = %descriptor.name, key = %text, error = %err, "stored key not comparable, left alone");
            }
        }
    }

    let mut columns = normalizer.column_names();
    columns.extend(
        [IS_DELETED, LAST_UPDATED]
            .into_iter()
            .filter(|column| descriptor.has_column(column))
            .map(str::to_string),
    );

    debug!(
        table = %descriptor.name,
        upserts = rows_to_upsert.len(),
        soft_deletes = ids_to_soft_delete.len(),
        rejected_rows,
        degraded_fields,
        "plan built"
    );

    Ok(SyncPlan {
        table: descriptor.name.clone(),
        columns,
        rows_to_upsert,
        ids_to_soft_delete,
        rejected_rows,
        degraded_fields,
        duplicate_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmis::sync::model::{ColumnDescriptor, RawRecord, SemanticType};
    use chrono::NaiveDate;

    fn column(name: &str, semantic_type: SemanticType) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            semantic_type,
            declared_type: "text".to_string(),
            nullable: name != "ID",
            is_primary_key: name == "ID",
        }
    }

    fn descriptor() -> TableDescriptor {
        TableDescriptor {
            schema: "public".into(),
            name: "DuAn".into(),
            columns: vec![
                column("ID", SemanticType::Integer),
                column("TenDuAn", SemanticType::Text),
                column(IS_DELETED, SemanticType::Text),
                column(LAST_UPDATED, SemanticType::Date),
            ],
            primary_key: "ID".into(),
        }
    }

    fn sheet(rows: &[(RawValue, &str)]) -> SourceSheet {
        let mut sheet = SourceSheet::new("DuAn");
        sheet.columns = vec!["ID".into(), "TenDuAn".into(), "Extra".into()];
        sheet.rows = rows
            .iter()
            .map(|(id, name)| {
                RawRecord::from([
                    ("ID".to_string(), id.clone()),
                    ("TenDuAn".to_string(), RawValue::Text(name.to_string())),
                    ("Extra".to_string(), RawValue::Text("ignored".into())),
                ])
            })
            .collect();
        sheet
    }

    fn stamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .and_then(|date| date.and_hms_opt(7, 0, 0))
            .expect("timestamp")
    }

    fn keys(values: &[i64]) -> Vec<String> {
        values.iter().map(i64::to_string).collect()
    }

    #[test]
    fn absent_keys_become_soft_deletes() {
        let sheet = sheet(&[(RawValue::Int(1), "A"), (RawValue::Float(2.0), "B")]);
        let plan = build_plan(&descriptor(), &sheet, &keys(&[1, 2, 3]), stamp()).expect("plan");

        assert_eq!(plan.rows_to_upsert.len(), 2);
        assert_eq!(
            plan.ids_to_soft_delete,
            BTreeSet::from([TypedValue::Integer(3)])
        );
        assert_eq!(plan.columns, vec!["ID", "TenDuAn", IS_DELETED, LAST_UPDATED]);
    }

    #[test]
    fn upserted_keys_are_never_soft_deleted() {
        let sheet = sheet(&[(RawValue::Text("3".into()), "C")]);
        let plan = build_plan(&descriptor(), &sheet, &keys(&[3]), stamp()).expect("plan");
        assert!(plan.ids_to_soft_delete.is_empty());
        for record in &plan.rows_to_upsert {
            assert!(!plan.ids_to_soft_delete.contains(&record.key));
        }
    }

    #[test]
    fn rejected_rows_do_not_protect_their_keys() {
        let sheet = sheet(&[(RawValue::Empty, "no key"), (RawValue::Int(1), "A")]);
        let plan = build_plan(&descriptor(), &sheet, &keys(&[1, 2]), stamp()).expect("plan");
        assert_eq!(plan.rejected_rows, 1);
        assert_eq!(plan.rows_to_upsert.len(), 1);
        assert_eq!(
            plan.ids_to_soft_delete,
            BTreeSet::from([TypedValue::Integer(2)])
        );
    }

    #[test]
    fn duplicate_keys_keep_the_last_row() {
        let sheet = sheet(&[(RawValue::Int(1), "first"), (RawValue::Int(1), "second")]);
        let plan = build_plan(&descriptor(), &sheet, &[], stamp()).expect("plan");
        assert_eq!(plan.duplicate_keys, 1);
        assert_eq!(plan.rows_to_upsert.len(), 1);
        assert_eq!(
            plan.rows_to_upsert[0].get("TenDuAn"),
            TypedValue::Text("second".into())
        );
    }

    #[test]
    fn sheet_without_key_column_is_refused() {
        let mut sheet = sheet(&[(RawValue::Int(1), "A")]);
        sheet.columns.retain(|column| column != "ID");
        let err = build_plan(&descriptor(), &sheet, &keys(&[1]), stamp()).expect_err("no key");
        assert!(matches!(err, SyncError::MissingKeyColumn { .. }));
    }
}
