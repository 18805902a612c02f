//! Schema registry: destination table descriptors reflected once per run.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::pmis::sync::destination::Destination;
use crate::pmis::sync::error::{Result, SyncError};
use crate::pmis::sync::model::{SemanticType, TableDescriptor};

/// Column-name fragments marking a text column as carrying dates.
const DATE_MARKERS: [&str; 2] = ["ngay", "date"];

/// Derives the coercion rule for a column from its catalog type.
///
/// Declared numeric and temporal types win. Only text-like columns fall back
/// to the name marker, so an integer column such as `SoNgay` stays integral.
pub fn classify_column(name: &str, declared_type: &str, scale: Option<i32>) -> SemanticType {
    match declared_type.to_lowercase().as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "int" | "serial"
        | "bigserial" | "smallserial" => SemanticType::Integer,
        "numeric" | "decimal" => SemanticType::Decimal {
            scale: scale.and_then(|scale| u32::try_from(scale).ok()),
        },
        "date" | "timestamp" | "timestamptz" => SemanticType::Date,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" if has_date_marker(name) => {
            SemanticType::Date
        }
        _ => SemanticType::Text,
    }
}

fn has_date_marker(name: &str) -> bool {
    let lowered = name.to_lowercase();
    DATE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Descriptors of the configured tables that exist in the destination.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableDescriptor>,
    missing: BTreeMap<String, String>,
}

impl SchemaRegistry {
    /// Reflects every requested table.
    ///
    /// Tables the destination lacks (or cannot reconcile for want of a single
    /// primary key) are recorded as missing; any other error ends the run.
    #[instrument(level = "info", skip_all, fields(tables = tables.len()))]
    pub async fn reflect<D>(destination: &mut D, tables: &[String]) -> Result<Self>
    where
        D: Destination + ?Sized,
    {
        let mut registry = SchemaRegistry::default();
        for table in tables {
            match destination.describe_table(table).await {
                Ok(descriptor) => {
                    debug!(
                        table = %table,
                        columns = descriptor.columns.len(),
                        primary_key = %descriptor.primary_key,
                        "table reflected"
                    );
                    registry.insert(descriptor);
                }
                Err(err) if err.is_schema_miss() => {
                    warn!(table = %table, error = %err, "table unavailable, it will be skipped");
                    registry.missing.insert(table.clone(), err.to_string());
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            reflected = registry.len(),
            missing = registry.missing.len(),
            "schema reflected"
        );
        Ok(registry)
    }

    pub fn insert(&mut self, descriptor: TableDescriptor) {
        self.missing.remove(&descriptor.name);
        self.tables.insert(descriptor.name.clone(), descriptor);
    }

    /// Descriptor of `table`, or `SchemaNotFound` when it was not reflected.
    pub fn get(&self, table: &str) -> Result<&TableDescriptor> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::SchemaNotFound(table.to_string()))
    }

    /// Tables that could not be reflected, with the reason.
    pub fn missing(&self) -> &BTreeMap<String, String> {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
