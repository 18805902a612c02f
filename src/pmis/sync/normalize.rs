//! Row normalisation: raw sheet rows typed against a destination table.
//!
//! Field coercion is deliberately forgiving. A value that cannot be typed
//! becomes null and the row is still written. The primary key is the one
//! strict path: a row whose key is blank or unparseable is rejected.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::debug;

use crate::pmis::sync::io::excel_read::excel_serial_to_datetime;
use crate::pmis::sync::model::{
    ColumnDescriptor, IS_DELETED, LAST_UPDATED, NormalizedRecord, RawRecord, RawValue,
    SemanticType, TableDescriptor, TypedValue,
};

/// Cell contents read as missing, whatever the column type.
const NA_MARKERS: [&str; 21] = [
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null", "NaT", "nat", "#VALUE!",
];

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Month-first before day-first, matching the usual spreadsheet tooling.
const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y",
];

/// A single field that could not be typed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read '{value}' as {expected}")]
pub struct CoercionError {
    pub value: String,
    pub expected: &'static str,
}

impl CoercionError {
    fn new(raw: &RawValue, expected: &'static str) -> Self {
        Self {
            value: raw.to_string(),
            expected,
        }
    }
}

/// Why a whole row was left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("primary key {column} is empty")]
    MissingKey { column: String },
    #[error("primary key {column} is invalid: {source}")]
    InvalidKey {
        column: String,
        #[source]
        source: CoercionError,
    },
    #[error("column {column} is NOT NULL but has no usable value")]
    MissingRequired { column: String },
}

/// Whether a cell is blank or one of the usual missing-value spellings.
pub fn is_missing(raw: &RawValue) -> bool {
    match raw {
        RawValue::Empty => true,
        RawValue::Float(value) => value.is_nan(),
        RawValue::Text(value) => {
            let trimmed = value.trim();
            trimmed.is_empty() || NA_MARKERS.contains(&trimmed)
        }
        _ => false,
    }
}

/// Types one raw cell for `column`.
pub fn coerce(raw: &RawValue, column: &ColumnDescriptor) -> Result<TypedValue, CoercionError> {
    if is_missing(raw) {
        return Ok(TypedValue::Null);
    }
    match column.semantic_type {
        SemanticType::Integer => to_integer(raw)
            .and_then(|value| within_declared_width(raw, value, &column.declared_type))
            .map(TypedValue::Integer),
        SemanticType::Decimal { scale } => to_decimal(raw, scale).map(TypedValue::Decimal),
        SemanticType::Date => to_date(raw).map(TypedValue::Date),
        SemanticType::Text => Ok(TypedValue::Text(to_text(raw))),
    }
}

fn to_integer(raw: &RawValue) -> Result<i64, CoercionError> {
    let fail = || CoercionError::new(raw, "an integer");
    match raw {
        RawValue::Int(value) => Ok(*value),
        RawValue::Bool(value) => Ok(i64::from(*value)),
        RawValue::Float(value) => {
            let truncated = value.trunc();
            if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64
            {
                Ok(truncated as i64)
            } else {
                Err(fail())
            }
        }
        RawValue::Text(value) => {
            let trimmed = value.trim();
            if let Ok(parsed) = trimmed.parse::<i64>() {
                return Ok(parsed);
            }
            parse_decimal(trimmed)
                .filter(|decimal| decimal.fract().is_zero())
                .and_then(|decimal| decimal.to_i64())
                .ok_or_else(fail)
        }
        RawValue::DateTime(_) | RawValue::Empty => Err(fail()),
    }
}

/// Rejects values the column's integer type cannot hold, so the database
/// cast does not fail the whole batch.
fn within_declared_width(
    raw: &RawValue,
    value: i64,
    declared_type: &str,
) -> Result<i64, CoercionError> {
    let (min, max) = match declared_type.to_lowercase().as_str() {
        "int2" | "smallint" | "smallserial" => (i64::from(i16::MIN), i64::from(i16::MAX)),
        "int4" | "int" | "integer" | "serial" => (i64::from(i32::MIN), i64::from(i32::MAX)),
        _ => (i64::MIN, i64::MAX),
    };
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(CoercionError::new(raw, "an integer within the column's range"))
    }
}

fn to_decimal(raw: &RawValue, scale: Option<u32>) -> Result<Decimal, CoercionError> {
    let parsed = match raw {
        RawValue::Int(value) => Some(Decimal::from(*value)),
        // Shortest round-trip text keeps 1234.565 as 1234.565, not its binary neighbour.
        RawValue::Float(value) => parse_decimal(&value.to_string()),
        RawValue::Text(value) => parse_decimal(value.trim()),
        RawValue::Bool(_) | RawValue::DateTime(_) | RawValue::Empty => None,
    };
    let decimal = parsed.ok_or_else(|| CoercionError::new(raw, "a decimal number"))?;
    Ok(match scale {
        Some(scale) => round_to_scale(decimal, scale),
        None => decimal,
    })
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Rounds half away from zero and pads to exactly `scale` fractional digits.
pub fn round_to_scale(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    if scale <= 28 {
        rounded.rescale(scale);
    }
    rounded
}

fn to_date(raw: &RawValue) -> Result<NaiveDate, CoercionError> {
    let parsed = match raw {
        RawValue::DateTime(value) => Some(value.date()),
        RawValue::Int(value) => excel_serial_to_datetime(*value as f64).map(|dt| dt.date()),
        RawValue::Float(value) => excel_serial_to_datetime(*value).map(|dt| dt.date()),
        RawValue::Text(value) => parse_date_text(value.trim()),
        RawValue::Bool(_) | RawValue::Empty => None,
    };
    parsed.ok_or_else(|| CoercionError::new(raw, "a date"))
}

/// Lenient date parsing over the spellings seen in hand-kept sheets.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if let Ok(value) = DateTime::parse_from_rfc3339(text) {
        return Some(value.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|value| value.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        })
}

fn to_text(raw: &RawValue) -> String {
    raw.to_string()
}

/// Destination columns fed from the sheet, in destination order.
///
/// Sheet columns the destination lacks are dropped, as are the bookkeeping
/// columns, which the normaliser always sets itself.
pub fn mapped_columns(descriptor: &TableDescriptor, sheet_columns: &[String]) -> Vec<String> {
    descriptor
        .columns
        .iter()
        .map(|column| column.name.as_str())
        .filter(|name| *name != IS_DELETED && *name != LAST_UPDATED)
        .filter(|name| sheet_columns.iter().any(|column| column == name))
        .map(str::to_string)
        .collect()
}

/// A normalised row together with the number of fields degraded to null.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub record: NormalizedRecord,
    pub degraded_fields: usize,
}

/// Maps raw rows of one sheet onto one destination table.
#[derive(Debug)]
pub struct RowNormalizer<'a> {
    descriptor: &'a TableDescriptor,
    columns: Vec<&'a ColumnDescriptor>,
    run_started: NaiveDateTime,
}

impl<'a> RowNormalizer<'a> {
    pub fn new(
        descriptor: &'a TableDescriptor,
        sheet_columns: &[String],
        run_started: NaiveDateTime,
    ) -> Self {
        let columns = mapped_columns(descriptor, sheet_columns)
            .iter()
            .filter_map(|name| descriptor.column(name))
            .collect();
        Self {
            descriptor,
            columns,
            run_started,
        }
    }

    /// Names of the columns this normaliser fills from the sheet.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRow, RowRejection> {
        let key_name = &self.descriptor.primary_key;
        let mut values = BTreeMap::new();
        let mut degraded_fields = 0;
        let mut key = TypedValue::Null;

        for column in &self.columns {
            let cell = raw.get(&column.name).unwrap_or(&RawValue::Empty);
            let coerced = coerce(cell, column);
            if column.name == *key_name {
                key = coerced.map_err(|source| RowRejection::InvalidKey {
                    column: key_name.clone(),
                    source,
                })?;
                values.insert(column.name.clone(), key.clone());
                continue;
            }
            let value = coerced.unwrap_or_else(|err| {
                debug!(
                    table = %self.descriptor.name,
                    column = %column.name,
                    error = %err,
                    "field degraded to null"
                );
                degraded_fields += 1;
                TypedValue::Null
            });
            if value.is_null() && !column.nullable {
                return Err(RowRejection::MissingRequired {
                    column: column.name.clone(),
                });
            }
            values.insert(column.name.clone(), value);
        }

        if key.is_null() {
            return Err(RowRejection::MissingKey {
                column: key_name.clone(),
            });
        }

        Ok(NormalizedRow {
            record: NormalizedRecord {
                key,
                values,
                is_deleted: false,
                last_updated: self.run_started,
            },
            degraded_fields,
        })
    }
}
