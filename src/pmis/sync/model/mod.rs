use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bookkeeping column flagging a logically removed row.
pub const IS_DELETED: &str = "is_deleted";
/// Bookkeeping column stamped with the run time of every touched row.
pub const LAST_UPDATED: &str = "last_updated";

/// Rendering used whenever a timestamp crosses into SQL text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// How values destined for a column are coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    /// 64-bit integer.
    Integer,
    /// Fixed-point decimal, rounded to `scale` digits when the column declares one.
    Decimal { scale: Option<u32> },
    /// Calendar date, parsed leniently.
    Date,
    /// Everything else travels as text.
    Text,
}

/// One destination column as reflected from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
    /// Catalog type name (`udt_name`), used to cast text parameters on write.
    pub declared_type: String,
    /// False for `NOT NULL` columns; rows that would write null there are rejected.
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// Immutable description of a destination table for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnDescriptor>,
    /// Name of the single primary-key column.
    pub primary_key: String,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn key_column(&self) -> Option<&ColumnDescriptor> {
        self.column(&self.primary_key)
    }

    /// Whether both bookkeeping columns exist, which soft deletion relies on.
    pub fn supports_soft_delete(&self) -> bool {
        self.has_column(IS_DELETED) && self.has_column(LAST_UPDATED)
    }

    /// Schema-qualified, quoted table name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An untyped spreadsheet cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl RawValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, RawValue::Empty)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Empty => Ok(()),
            RawValue::Text(value) => f.write_str(value),
            RawValue::Int(value) => write!(f, "{value}"),
            RawValue::Float(value) => write!(f, "{value}"),
            RawValue::Bool(value) => write!(f, "{value}"),
            RawValue::DateTime(value) => {
                if value.time() == chrono::NaiveTime::MIN {
                    write!(f, "{}", value.date())
                } else {
                    write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S"))
                }
            }
        }
    }
}

/// Column name → cell mapping for one sheet row.
pub type RawRecord = BTreeMap<String, RawValue>;

/// The rows of one worksheet. The sheet name is the destination table name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceSheet {
    pub name: String,
    /// Header names in sheet order.
    pub columns: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl SourceSheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every sheet of a workbook, keyed by sheet name.
pub type SourceWorkbook = BTreeMap<String, SourceSheet>;

/// A value typed for its destination column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypedValue {
    Null,
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Boolean(bool),
    Text(String),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    /// Text form handed to the database, which casts it to the column type.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            TypedValue::Null => None,
            TypedValue::Integer(value) => Some(value.to_string()),
            TypedValue::Decimal(value) => Some(value.to_string()),
            TypedValue::Date(value) => Some(value.format("%Y-%m-%d").to_string()),
            TypedValue::Timestamp(value) => Some(value.format(TIMESTAMP_FORMAT).to_string()),
            TypedValue::Boolean(value) => Some(value.to_string()),
            TypedValue::Text(value) => Some(value.clone()),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

/// A sheet row mapped onto a destination table's typed column set.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Primary-key value; never null.
    pub key: TypedValue,
    /// Destination column → typed value, bookkeeping columns excluded.
    pub values: BTreeMap<String, TypedValue>,
    pub is_deleted: bool,
    pub last_updated: NaiveDateTime,
}

impl NormalizedRecord {
    /// Value written to `column`, bookkeeping columns included.
    pub fn get(&self, column: &str) -> TypedValue {
        match column {
            IS_DELETED => TypedValue::Boolean(self.is_deleted),
            LAST_UPDATED => TypedValue::Timestamp(self.last_updated),
            _ => self.values.get(column).cloned().unwrap_or(TypedValue::Null),
        }
    }
}

/// A parent→child relationship along which soft deletion cascades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRule {
    pub child: String,
    pub foreign_key: String,
    pub parent: String,
}

impl OrphanRule {
    pub fn new(
        child: impl Into<String>,
        foreign_key: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            child: child.into(),
            foreign_key: foreign_key.into(),
            parent: parent.into(),
        }
    }
}

impl fmt::Display for OrphanRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.child, self.foreign_key, self.parent)
    }
}
