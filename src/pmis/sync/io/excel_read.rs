use std::collections::HashMap;
use std::path::Path;

use calamine::{DataType, Reader, Xlsx, open_workbook};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tracing::{debug, instrument};

use crate::pmis::sync::error::{Result, SyncError};
use crate::pmis::sync::model::{RawRecord, RawValue, SourceSheet, SourceWorkbook};

/// Reads every sheet of an `.xlsx` workbook into untyped row sets.
///
/// The first row of a sheet is its header. Values are kept as they are stored
/// in the cells; typing them is the normaliser's job.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn read_workbook(path: &Path) -> Result<SourceWorkbook> {
    if !path.exists() {
        return Err(SyncError::source_unreadable(path, "file not found"));
    }

    let mut workbook: Xlsx<_> =
        open_workbook(path).map_err(|err| SyncError::source_unreadable(path, err))?;

    let mut sheets = SourceWorkbook::new();
    for name in workbook.sheet_names().to_owned() {
        let range = match workbook.worksheet_range(&name) {
            Some(Ok(range)) => range,
            Some(Err(err)) => return Err(SyncError::source_unreadable(path, err)),
            None => continue,
        };
        let sheet = read_sheet(&name, &range);
        debug!(
            sheet = %name,
            columns = sheet.columns.len(),
            rows = sheet.rows.len(),
            "sheet loaded"
        );
        sheets.insert(name, sheet);
    }

    Ok(sheets)
}

fn read_sheet(name: &str, range: &calamine::Range<DataType>) -> SourceSheet {
    let mut sheet = SourceSheet::new(name);
    let mut rows = range.rows();

    let headers: Vec<Option<String>> = match rows.next() {
        Some(first_row) => header_names(first_row),
        None => return sheet,
    };
    sheet.columns = headers.iter().flatten().cloned().collect();

    for row in rows {
        let mut record = RawRecord::new();
        let mut has_data = false;
        for (idx, header) in headers.iter().enumerate() {
            let Some(header) = header else { continue };
            let value = cell_to_raw(row.get(idx));
            has_data |= !value.is_empty();
            record.insert(header.clone(), value);
        }
        if has_data {
            sheet.rows.push(record);
        }
    }

    sheet
}

/// Header cells as column names, kept verbatim. Blank headers drop their
/// column; repeated names get `.1`, `.2`, ... so the first occurrence keeps
/// the exact name.
fn header_names(row: &[DataType]) -> Vec<Option<String>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    row.iter()
        .map(|cell| {
            let name = cell_to_string(cell);
            if name.trim().is_empty() {
                return None;
            }
            let count = seen.entry(name.clone()).or_insert(0);
            let unique = if *count == 0 {
                name
            } else {
                format!("{name}.{count}")
            };
            *count += 1;
            Some(unique)
        })
        .collect()
}

fn cell_to_raw(cell: Option<&DataType>) -> RawValue {
    match cell {
        Some(DataType::String(value)) => RawValue::Text(value.clone()),
        Some(DataType::Float(value)) => RawValue::Float(*value),
        Some(DataType::Int(value)) => RawValue::Int(*value),
        Some(DataType::Bool(value)) => RawValue::Bool(*value),
        Some(DataType::DateTime(serial)) => match excel_serial_to_datetime(*serial) {
            Some(value) => RawValue::DateTime(value),
            None => RawValue::Float(*serial),
        },
        Some(DataType::Error(_)) | Some(DataType::Empty) | None => RawValue::Empty,
        Some(other) => RawValue::Text(other.to_string()),
    }
}

fn cell_to_string(cell: &DataType) -> String {
    match cell {
        DataType::String(value) => value.clone(),
        DataType::Float(value) => value.to_string(),
        DataType::Int(value) => value.to_string(),
        DataType::Bool(value) => value.to_string(),
        DataType::Empty | DataType::Error(_) => String::new(),
        other => other.to_string(),
    }
}

/// Converts an Excel serial day number (1900 date system) to a timestamp.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}
