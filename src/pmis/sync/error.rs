use std::path::PathBuf;

use thiserror::Error;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type covering the failure cases of a synchronisation run.
///
/// Only some of them end a run: see [`SyncError::is_fatal`]. The others are
/// contained to the table, batch or cascade rule that raised them.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration; nothing has been touched yet.
    #[error("configuration error: {0}")]
    Config(String),

    /// The source workbook could not be opened at all.
    #[error("source workbook {path} is unreadable: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    /// A configured table does not exist in the destination.
    #[error("table {0} does not exist in the destination")]
    SchemaNotFound(String),

    /// A destination table without a primary key cannot be reconciled.
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),

    /// Reconciliation keys on a single column.
    #[error("table {0} has a composite primary key")]
    CompositePrimaryKey(String),

    /// The sheet does not carry the destination's primary-key column.
    #[error("sheet {table} has no primary key column {column}")]
    MissingKeyColumn { table: String, column: String },

    /// A write transaction failed and was rolled back.
    #[error("batch {batch} of table {table} failed: {message}")]
    BatchWrite {
        table: String,
        batch: usize,
        message: String,
    },

    /// Destination connection or query error, with the server's message when there is one.
    #[error("database error: {}", describe_database_error(.0))]
    Database(#[from] tokio_postgres::Error),

    /// Wrapper for IO failures such as reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialisation error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl SyncError {
    pub fn source_unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::SourceUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn batch_write(table: impl Into<String>, batch: usize, message: impl ToString) -> Self {
        SyncError::BatchWrite {
            table: table.into(),
            batch,
            message: message.to_string(),
        }
    }

    /// Whether the error aborts the whole run rather than a single table.
    ///
    /// A query error is contained to its table; a closed connection is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Database(err) => err.is_closed(),
            SyncError::Config(_)
            | SyncError::SourceUnreadable { .. }
            | SyncError::Io(_)
            | SyncError::Yaml(_)
            | SyncError::Logging(_) => true,
            _ => false,
        }
    }

    /// Whether a table lookup failed because the destination lacks a usable table.
    pub fn is_schema_miss(&self) -> bool {
        matches!(
            self,
            SyncError::SchemaNotFound(_)
                | SyncError::NoPrimaryKey(_)
                | SyncError::CompositePrimaryKey(_)
        )
    }

    /// Process exit code for errors that end the run.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 2,
            SyncError::SourceUnreadable { .. } => 3,
            SyncError::Database(_) => 4,
            _ => 1,
        }
    }

    /// Formats the error together with its chain of causes.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("error: {self}");
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\n  caused by ({depth}): {err}"));
            source = err.source();
            depth += 1;
        }
        output
    }
}

/// `tokio_postgres` only says "db error" at the top level; the server's
/// message, code and detail live in the source.
fn describe_database_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => server_message(
            db.code().code(),
            db.message(),
            db.detail(),
            db.column(),
        ),
        None => match std::error::Error::source(err) {
            Some(source) => format!("{err}: {source}"),
            None => err.to_string(),
        },
    }
}

fn server_message(
    code: &str,
    message: &str,
    detail: Option<&str>,
    column: Option<&str>,
) -> String {
    let mut text = format!("{message} (SQLSTATE {code})");
    if let Some(column) = column {
        text.push_str(&format!(", column {column}"));
    }
    if let Some(detail) = detail {
        text.push_str(&format!(": {detail}"));
    }
    text
}
