//! PostgreSQL destination.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, error, info};

use crate::pmis::sync::config::DatabaseConfig;
use crate::pmis::sync::destination::Destination;
use crate::pmis::sync::error::{Result, SyncError};
use crate::pmis::sync::model::{
    ColumnDescriptor, IS_DELETED, LAST_UPDATED, NormalizedRecord, TIMESTAMP_FORMAT,
    TableDescriptor, TypedValue, quote_ident,
};
use crate::pmis::sync::schema::classify_column;

/// Upper bound on bind parameters in a single PostgreSQL statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

const COLUMNS_QUERY: &str = r#"
    SELECT
        column_name::text,
        udt_name::text,
        numeric_scale::int4,
        is_nullable = 'YES'
    FROM information_schema.columns
    WHERE table_schema = $1 AND table_name = $2
    ORDER BY ordinal_position
"#;

const PRIMARY_KEY_QUERY: &str = r#"
    SELECT a.attname::text
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype = 'p'
      AND a.attnum = ANY(c.conkey)
    ORDER BY array_position(c.conkey, a.attnum)
"#;

/// Destination backed by a single PostgreSQL connection.
pub struct PgDestination {
    client: Client,
    schema: String,
}

impl PgDestination {
    /// Opens the connection and checks it answers.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(config.resolved_password())
            .application_name("pmis-sync")
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let (client, connection) = pg_config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "PostgreSQL connection closed with an error");
            }
        });

        client.simple_query("SELECT 1").await?;
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "connected to PostgreSQL"
        );

        Ok(Self {
            client,
            schema: config.schema.clone(),
        })
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn describe_table(&mut self, table: &str) -> Result<TableDescriptor> {
        let rows = self
            .client
            .query(COLUMNS_QUERY, &[&self.schema, &table])
            .await?;
        if rows.is_empty() {
            return Err(SyncError::SchemaNotFound(table.to_string()));
        }

        let key_rows = self
            .client
            .query(PRIMARY_KEY_QUERY, &[&self.schema, &table])
            .await?;
        let keys: Vec<String> = key_rows.iter().map(|row| row.get(0)).collect();
        let primary_key = match keys.as_slice() {
            [] => return Err(SyncError::NoPrimaryKey(table.to_string())),
            [single] => single.clone(),
            _ => return Err(SyncError::CompositePrimaryKey(table.to_string())),
        };

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let declared_type: String = row.get(1);
                let scale: Option<i32> = row.get(2);
                ColumnDescriptor {
                    semantic_type: classify_column(&name, &declared_type, scale),
                    is_primary_key: name == primary_key,
                    nullable: row.get(3),
                    name,
                    declared_type,
                }
            })
            .collect();

        Ok(TableDescriptor {
            schema: self.schema.clone(),
            name: table.to_string(),
            columns,
            primary_key,
        })
    }

    async fn existing_keys(&mut self, table: &TableDescriptor) -> Result<Vec<String>> {
        let rows = self.client.query(&existing_keys_sql(table), &[]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn soft_delete(
        &mut self,
        table: &TableDescriptor,
        keys: &[TypedValue],
        at: NaiveDateTime,
    ) -> Result<u64> {
        let keys: Vec<String> = keys.iter().filter_map(TypedValue::to_sql_text).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = soft_delete_sql(table);
        let stamp = at.format(TIMESTAMP_FORMAT).to_string();

        let tx = self.client.transaction().await?;
        let affected = tx.execute(&sql, &[&stamp, &keys]).await?;
        tx.commit().await?;
        Ok(affected)
    }

    async fn upsert_batch(
        &mut self,
        table: &TableDescriptor,
        columns: &[String],
        rows: &[NormalizedRecord],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql(table, columns, rows.len());
        let params: Vec<Option<String>> = rows
            .iter()
            .flat_map(|row| columns.iter().map(|column| row.get(column).to_sql_text()))
            .collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param as &(dyn ToSql + Sync))
            .collect();

        let tx = self.client.transaction().await?;
        let affected = tx.execute(&sql, &refs).await?;
        tx.commit().await?;
        debug!(table = %table.name, rows = rows.len(), affected, "batch committed");
        Ok(affected)
    }

    async fn cascade_soft_delete(
        &mut self,
        child: &TableDescriptor,
        foreign_key: &str,
        parent: &TableDescriptor,
        at: NaiveDateTime,
    ) -> Result<u64> {
        let sql = cascade_sql(child, foreign_key, parent);
        let stamp = at.format(TIMESTAMP_FORMAT).to_string();

        let tx = self.client.transaction().await?;
        let affected = tx.execute(&sql, &[&stamp]).await?;
        tx.commit().await?;
        Ok(affected)
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

/// Cast turning a text parameter into the column's declared type.
fn cast_for(table: &TableDescriptor, column: &str) -> String {
    let declared = table
        .column(column)
        .map(|descriptor| descriptor.declared_type.as_str())
        .unwrap_or("text");
    format!("::text::{}", quote_ident(declared))
}

fn existing_keys_sql(table: &TableDescriptor) -> String {
    let key = quote_ident(&table.primary_key);
    format!(
        "SELECT {key}::text FROM {} WHERE {key} IS NOT NULL",
        table.qualified_name()
    )
}

fn soft_delete_sql(table: &TableDescriptor) -> String {
    let key = quote_ident(&table.primary_key);
    let key_type = table
        .key_column()
        .map(|column| quote_ident(&column.declared_type))
        .unwrap_or_else(|| "text".to_string());
    format!(
        "UPDATE {} SET {deleted} = true, {updated} = $1{stamp_cast} \
         WHERE {key} = ANY($2::text[]::{key_type}[]) AND {deleted} IS NOT TRUE",
        table.qualified_name(),
        deleted = quote_ident(IS_DELETED),
        updated = quote_ident(LAST_UPDATED),
        stamp_cast = cast_for(table, LAST_UPDATED),
    )
}

/// Multi-row `INSERT ... ON CONFLICT DO UPDATE`.
///
/// The update only fires when a column other than the key and
/// `last_updated` differs, so replaying an unchanged sheet writes nothing.
fn upsert_sql(table: &TableDescriptor, columns: &[String], row_count: usize) -> String {
    let key = &table.primary_key;
    let column_list = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");

    let casts: Vec<String> = columns
        .iter()
        .map(|column| cast_for(table, column))
        .collect();
    let mut placeholders = Vec::with_capacity(row_count);
    let mut index = 1;
    for _ in 0..row_count {
        let row: Vec<String> = casts
            .iter()
            .map(|cast| {
                let placeholder = format!("${index}{cast}");
                index += 1;
                placeholder
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }

    let updates: Vec<String> = columns
        .iter()
        .filter(|column| *column != key)
        .map(|column| format!("{0} = EXCLUDED.{0}", quote_ident(column)))
        .collect();
    let changes: Vec<String> = columns
        .iter()
        .filter(|column| *column != key && column.as_str() != LAST_UPDATED)
        .map(|column| change_check(table, column))
        .collect();

    let head = format!(
        "INSERT INTO {} AS target ({column_list}) VALUES {} ON CONFLICT ({})",
        table.qualified_name(),
        placeholders.join(", "),
        quote_ident(key)
    );
    if updates.is_empty() || changes.is_empty() {
        format!("{head} DO NOTHING")
    } else {
        format!(
            "{head} DO UPDATE SET {} WHERE {}",
            updates.join(", "),
            changes.join(" OR ")
        )
    }
}

/// Catalog types without an equality operator; their text forms are compared.
const TEXT_COMPARED_TYPES: [&str; 10] = [
    "json", "xml", "point", "line", "lseg", "path", "polygon", "_json", "_xml", "_point",
];

fn change_check(table: &TableDescriptor, column: &str) -> String {
    let quoted = quote_ident(column);
    let compare_text = table.column(column).is_some_and(|descriptor| {
        TEXT_COMPARED_TYPES.contains(&descriptor.declared_type.to_lowercase().as_str())
    });
    if compare_text {
        format!("target.{quoted}::text IS DISTINCT FROM EXCLUDED.{quoted}::text")
    } else {
        format!("target.{quoted} IS DISTINCT FROM EXCLUDED.{quoted}")
    }
}

fn cascade_sql(child: &TableDescriptor, foreign_key: &str, parent: &TableDescriptor) -> String {
    let deleted = quote_ident(IS_DELETED);
    format!(
        "UPDATE {child_table} SET {deleted} = true, {updated} = $1{stamp_cast} \
         WHERE {deleted} IS NOT TRUE AND {fk} IN \
         (SELECT {parent_key} FROM {parent_table} WHERE {deleted} IS TRUE)",
        child_table = child.qualified_name(),
        updated = quote_ident(LAST_UPDATED),
        stamp_cast = cast_for(child, LAST_UPDATED),
        fk = quote_ident(foreign_key),
        parent_key = quote_ident(&parent.primary_key),
        parent_table = parent.qualified_name(),
    )
}

/// Largest batch whose parameters fit in one statement.
pub fn effective_batch_size(batch_size: usize, column_count: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    batch_size.min(by_params).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmis::sync::model::SemanticType;

    fn column(name: &str, declared_type: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            semantic_type: SemanticType::Text,
            declared_type: declared_type.to_string(),
            nullable: name != "ID",
            is_primary_key: name == "ID",
        }
    }

    fn table(name: &str) -> TableDescriptor {
        TableDescriptor {
            schema: "public".into(),
            name: name.into(),
            columns: vec![
                column("ID", "int4"),
                column("TenDuAn", "varchar"),
                column("TongMucDauTu", "numeric"),
                column(IS_DELETED, "bool"),
                column(LAST_UPDATED, "timestamp"),
            ],
            primary_key: "ID".into(),
        }
    }

    #[test]
    fn upsert_casts_each_placeholder_and_skips_unchanged_rows() {
        let columns = vec![
            "ID".to_string(),
            "TenDuAn".to_string(),
            IS_DELETED.to_string(),
            LAST_UPDATED.to_string(),
        ];
        let sql = upsert_sql(&table("DuAn"), &columns, 2);

        assert!(sql.starts_with(
            "INSERT INTO \"public\".\"DuAn\" AS target (\"ID\", \"TenDuAn\", \"is_deleted\", \"last_updated\") VALUES "
        ));
        assert!(sql.contains("($1::text::\"int4\", $2::text::\"varchar\", $3::text::\"bool\", $4::text::\"timestamp\")"));
        assert!(sql.contains("($5::text::\"int4\""));
        assert!(sql.contains("$8::text::\"timestamp\")"));
        assert!(sql.contains("ON CONFLICT (\"ID\") DO UPDATE SET \"TenDuAn\" = EXCLUDED.\"TenDuAn\""));
        assert!(sql.contains("\"last_updated\" = EXCLUDED.\"last_updated\""));
        assert!(sql.contains("target.\"TenDuAn\" IS DISTINCT FROM EXCLUDED.\"TenDuAn\""));
        assert!(!sql.contains("target.\"last_updated\" IS DISTINCT FROM"));
    }

    #[test]
    fn json_columns_are_compared_as_text() {
        let mut issues = table("VanDe");
        issues.columns.insert(1, column("ThuocTinh", "json"));
        let columns = vec![
            "ID".to_string(),
            "ThuocTinh".to_string(),
            "TenDuAn".to_string(),
            IS_DELETED.to_string(),
            LAST_UPDATED.to_string(),
        ];
        let sql = upsert_sql(&issues, &columns, 1);

        assert!(sql.contains("$2::text::\"json\""));
        assert!(sql.contains(
            "target.\"ThuocTinh\"::text IS DISTINCT FROM EXCLUDED.\"ThuocTinh\"::text"
        ));
        assert!(!sql.contains("target.\"ThuocTinh\" IS DISTINCT FROM"));
        assert!(sql.contains("target.\"TenDuAn\" IS DISTINCT FROM EXCLUDED.\"TenDuAn\""));
    }

    #[test]
    fn key_only_upsert_does_nothing_on_conflict() {
        let columns = vec!["ID".to_string(), LAST_UPDATED.to_string()];
        let sql = upsert_sql(&table("DuAn"), &columns, 1);
        assert!(sql.ends_with("ON CONFLICT (\"ID\") DO NOTHING"));
    }

    #[test]
    fn soft_delete_only_touches_live_rows() {
        let sql = soft_delete_sql(&table("DuAn"));
        assert_eq!(
            sql,
            "UPDATE \"public\".\"DuAn\" SET \"is_deleted\" = true, \"last_updated\" = $1::text::\"timestamp\" \
             WHERE \"ID\" = ANY($2::text[]::\"int4\"[]) AND \"is_deleted\" IS NOT TRUE"
        );
    }

    #[test]
    fn cascade_follows_parent_key() {
        let sql = cascade_sql(&table("CongViec"), "DuAn_ID", &table("DuAn"));
        assert!(sql.starts_with("UPDATE \"public\".\"CongViec\" SET \"is_deleted\" = true"));
        assert!(sql.contains("WHERE \"is_deleted\" IS NOT TRUE AND \"DuAn_ID\" IN"));
        assert!(sql.contains("(SELECT \"ID\" FROM \"public\".\"DuAn\" WHERE \"is_deleted\" IS TRUE)"));
    }

    #[test]
    fn existing_keys_are_read_as_text() {
        assert_eq!(
            existing_keys_sql(&table("DuAn")),
            "SELECT \"ID\"::text FROM \"public\".\"DuAn\" WHERE \"ID\" IS NOT NULL"
        );
    }

    #[test]
    fn batches_respect_the_parameter_limit() {
        assert_eq!(effective_batch_size(500, 10), 500);
        assert_eq!(effective_batch_size(500, 200), 327);
        assert_eq!(effective_batch_size(0, 5), 1);
    }
}
