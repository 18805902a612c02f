#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use pmis_sync::destination::Destination;
use pmis_sync::model::{
    ColumnDescriptor, IS_DELETED, LAST_UPDATED, NormalizedRecord, SemanticType, TableDescriptor,
    TypedValue,
};
use pmis_sync::schema::classify_column;
use pmis_sync::{Result, SyncError};
use rust_xlsxwriter::Workbook;

pub type Row = BTreeMap<String, TypedValue>;

/// Cell written into a test workbook.
#[derive(Debug, Clone)]
pub enum Cell {
    Text(&'static str),
    Number(f64),
    Blank,
}

/// Writes `sheets` (name, header, rows) to an xlsx file.
pub fn write_workbook(path: &Path, sheets: &[(&str, &[&str], Vec<Vec<Cell>>)]) {
    let mut workbook = Workbook::new();
    for (name, header, rows) in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(*name).expect("sheet name");
        for (col, title) in header.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, *title)
                .expect("header cell");
        }
        for (index, row) in rows.iter().enumerate() {
            let row_number = index as u32 + 1;
            for (col, cell) in row.iter().enumerate() {
                match cell {
                    Cell::Text(text) => {
                        worksheet
                            .write_string(row_number, col as u16, *text)
                            .expect("text cell");
                    }
                    Cell::Number(value) => {
                        worksheet
                            .write_number(row_number, col as u16, *value)
                            .expect("number cell");
                    }
                    Cell::Blank => {}
                }
            }
        }
    }
    workbook.save(path).expect("workbook saved");
}

pub fn run_time(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 1)
        .and_then(|date| date.and_hms_opt(hour, 0, 0))
        .expect("timestamp")
}

/// Builds a descriptor the way reflection would, from `(name, udt_name)` pairs.
/// Bookkeeping columns are appended.
pub fn table(name: &str, columns: &[(&str, &str)]) -> TableDescriptor {
    let mut descriptor = table_without_bookkeeping(name, columns);
    descriptor.columns.push(ColumnDescriptor {
        name: IS_DELETED.to_string(),
        semantic_type: SemanticType::Text,
        declared_type: "bool".to_string(),
        nullable: true,
        is_primary_key: false,
    });
    descriptor.columns.push(ColumnDescriptor {
        name: LAST_UPDATED.to_string(),
        semantic_type: SemanticType::Date,
        declared_type: "timestamp".to_string(),
        nullable: true,
        is_primary_key: false,
    });
    descriptor
}

pub fn table_without_bookkeeping(name: &str, columns: &[(&str, &str)]) -> TableDescriptor {
    let descriptors: Vec<ColumnDescriptor> = columns
        .iter()
        .map(|(column, declared)| {
            let scale = (*declared == "numeric").then_some(2);
            ColumnDescriptor {
                name: column.to_string(),
                semantic_type: classify_column(column, declared, scale),
                declared_type: declared.to_string(),
                nullable: *column != "ID",
                is_primary_key: *column == "ID",
            }
        })
        .collect();
    TableDescriptor {
        schema: "public".to_string(),
        name: name.to_string(),
        columns: descriptors,
        primary_key: "ID".to_string(),
    }
}

struct MemoryTable {
    descriptor: TableDescriptor,
    rows: BTreeMap<TypedValue, Row>,
}

/// Destination holding tables in memory, with the same write semantics as the
/// PostgreSQL statements: change-detecting upserts, soft deletes that skip
/// rows already deleted, and the cascade sub-select.
#[derive(Default)]
pub struct MemoryDestination {
    tables: HashMap<String, MemoryTable>,
    /// `(table, n)`: the n-th upsert call for that table fails.
    failing_batches: HashSet<(String, usize)>,
    upsert_calls: HashMap<String, usize>,
    /// Every mutating call, successful or not.
    pub mutations: usize,
}

impl MemoryDestination {
    pub fn with_table(mut self, descriptor: TableDescriptor) -> Self {
        self.tables.insert(
            descriptor.name.clone(),
            MemoryTable {
                descriptor,
                rows: BTreeMap::new(),
            },
        );
        self
    }

    /// Stores a live row keyed by integer `ID`.
    pub fn seed(&mut self, table: &str, id: i64, values: &[(&str, TypedValue)]) {
        let mut row: Row = values
            .iter()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect();
        row.insert("ID".to_string(), TypedValue::Integer(id));
        row.insert(IS_DELETED.to_string(), TypedValue::Boolean(false));
        row.insert(LAST_UPDATED.to_string(), TypedValue::Timestamp(run_time(0)));
        self.tables
            .get_mut(table)
            .expect("seeded table exists")
            .rows
            .insert(TypedValue::Integer(id), row);
    }

    pub fn fail_batch(&mut self, table: &str, batch: usize) {
        self.failing_batches.insert((table.to_string(), batch));
    }

    pub fn row(&self, table: &str, id: i64) -> Option<&Row> {
        self.tables.get(table)?.rows.get(&TypedValue::Integer(id))
    }

    pub fn value(&self, table: &str, id: i64, column: &str) -> TypedValue {
        self.row(table, id)
            .and_then(|row| row.get(column).cloned())
            .unwrap_or(TypedValue::Null)
    }

    pub fn is_deleted(&self, table: &str, id: i64) -> bool {
        self.value(table, id, IS_DELETED) == TypedValue::Boolean(true)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |table| table.rows.len())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SyncError::SchemaNotFound(name.to_string()))
    }
}

fn deleted(row: &Row) -> bool {
    row.get(IS_DELETED) == Some(&TypedValue::Boolean(true))
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn describe_table(&mut self, table: &str) -> Result<TableDescriptor> {
        self.tables
            .get(table)
            .map(|table| table.descriptor.clone())
            .ok_or_else(|| SyncError::SchemaNotFound(table.to_string()))
    }

    async fn existing_keys(&mut self, table: &TableDescriptor) -> Result<Vec<String>> {
        let table = self.table_mut(&table.name)?;
        Ok(table
            .rows
            .keys()
            .filter_map(TypedValue::to_sql_text)
            .collect())
    }

    async fn soft_delete(
        &mut self,
        table: &TableDescriptor,
        keys: &[TypedValue],
        at: NaiveDateTime,
    ) -> Result<u64> {
        self.mutations += 1;
        let table = self.table_mut(&table.name)?;
        let mut affected = 0;
        for key in keys {
            if let Some(row) = table.rows.get_mut(key) {
                if !deleted(row) {
                    row.insert(IS_DELETED.to_string(), TypedValue::Boolean(true));
                    row.insert(LAST_UPDATED.to_string(), TypedValue::Timestamp(at));
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn upsert_batch(
        &mut self,
        table: &TableDescriptor,
        columns: &[String],
        rows: &[NormalizedRecord],
    ) -> Result<u64> {
        self.mutations += 1;
        let call = self.upsert_calls.entry(table.name.clone()).or_insert(0);
        let batch = *call;
        *call += 1;
        if self.failing_batches.contains(&(table.name.clone(), batch)) {
            return Err(SyncError::Config(format!(
                "null value in column \"TenDuAn\" violates not-null constraint (call {batch})"
            )));
        }

        let key_column = table.primary_key.clone();
        let table = self.table_mut(&table.name)?;
        let mut affected = 0;
        for record in rows {
            let incoming: Row = columns
                .iter()
                .map(|column| (column.clone(), record.get(column)))
                .collect();
            match table.rows.get_mut(&record.key) {
                None => {
                    table.rows.insert(record.key.clone(), incoming);
                    affected += 1;
                }
                Some(current) => {
                    let changed = columns
                        .iter()
                        .filter(|column| **column != key_column && column.as_str() != LAST_UPDATED)
                        .any(|column| {
                            current.get(column).unwrap_or(&TypedValue::Null)
                                != incoming.get(column).unwrap_or(&TypedValue::Null)
                        });
                    if changed {
                        current.extend(incoming);
                        affected += 1;
                    }
                }
            }
        }
        Ok(affected)
    }

    async fn cascade_soft_delete(
        &mut self,
        child: &TableDescriptor,
        foreign_key: &str,
        parent: &TableDescriptor,
        at: NaiveDateTime,
    ) -> Result<u64> {
        self.mutations += 1;
        let deleted_parents: HashSet<TypedValue> = self
            .table_mut(&parent.name)?
            .rows
            .iter()
            .filter(|(_, row)| deleted(row))
            .map(|(key, _)| key.clone())
            .collect();

        let child = self.table_mut(&child.name)?;
        let mut affected = 0;
        for row in child.rows.values_mut() {
            let orphaned = row
                .get(foreign_key)
                .is_some_and(|parent_key| deleted_parents.contains(parent_key));
            if orphaned && !deleted(row) {
                row.insert(IS_DELETED.to_string(), TypedValue::Boolean(true));
                row.insert(LAST_UPDATED.to_string(), TypedValue::Timestamp(at));
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
