//! Run configuration loaded from YAML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pmis::sync::error::{Result, SyncError};
use crate::pmis::sync::model::OrphanRule;

/// Rows per upsert statement unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncOptions,
}

/// Destination database connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Falls back to `PGPASSWORD` when empty.
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Location of the source workbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
}

/// Processing order, cascade rules and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Tables in processing order, parents before children.
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_cascade")]
    pub cascade: Vec<OrphanRule>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            tables: default_tables(),
            cascade: default_cascade(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// PMIS tables, parents before the tables that reference them.
pub fn default_tables() -> Vec<String> {
    [
        "PhongBan",
        "CongTy",
        "NhomMucTieu",
        "ChuKy",
        "CanCuPhapLy",
        "NhanSu",
        "DuAn",
        "MucTieu",
        "CongViec",
        "GoiThau",
        "VanBanPhapLy",
        "VanDe",
        "HopDong",
        "TienTrinhXuLy",
        "PhanCongNhanSu",
        "PhanCongMucTieu",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// PMIS relationships along which soft deletion cascades.
pub fn default_cascade() -> Vec<OrphanRule> {
    vec![
        OrphanRule::new("CongViec", "DuAn_ID", "DuAn"),
        OrphanRule::new("GoiThau", "DuAn_ID", "DuAn"),
        OrphanRule::new("VanDe", "DuAn_ID", "DuAn"),
        OrphanRule::new("VanBanPhapLy", "DuAn_ID", "DuAn"),
        OrphanRule::new("HopDong", "GoiThau_ID", "GoiThau"),
        OrphanRule::new("TienTrinhXuLy", "CongViec_ID", "CongViec"),
        OrphanRule::new("PhanCongNhanSu", "CongViec_ID", "CongViec"),
        OrphanRule::new("PhanCongMucTieu", "MucTieu_ID", "MucTieu"),
    ]
}

impl SyncConfig {
    /// Loads and validates a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let db = &self.database;
        for (field, value) in [
            ("database.host", &db.host),
            ("database.user", &db.user),
            ("database.database", &db.database),
            ("database.schema", &db.schema),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("{field} is required")));
            }
        }
        if db.port == 0 {
            return Err(SyncError::Config("database.port must be non-zero".into()));
        }
        if self.source.path.as_os_str().is_empty() {
            return Err(SyncError::Config("source.path is required".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("sync.batch_size must be at least 1".into()));
        }
        if self.sync.tables.is_empty() {
            return Err(SyncError::Config("sync.tables must list at least one table".into()));
        }

        let mut seen = HashSet::new();
        for table in &self.sync.tables {
            if table.trim().is_empty() {
                return Err(SyncError::Config("sync.tables contains an empty name".into()));
            }
            if !seen.insert(table.as_str()) {
                return Err(SyncError::Config(format!(
                    "sync.tables lists {table} more than once"
                )));
            }
        }

        for rule in &self.sync.cascade {
            if rule.child.trim().is_empty()
                || rule.foreign_key.trim().is_empty()
                || rule.parent.trim().is_empty()
            {
                return Err(SyncError::Config(format!(
                    "sync.cascade rule '{rule}' has an empty field"
                )));
            }
        }

        Ok(())
    }
}

impl SyncOptions {
    /// Cascade rules naming a table outside the processing list.
    pub fn unlisted_cascade_rules(&self) -> Vec<&OrphanRule> {
        let listed: HashSet<&str> = self.tables.iter().map(String::as_str).collect();
        self.cascade
            .iter()
            .filter(|rule| {
                !listed.contains(rule.child.as_str()) || !listed.contains(rule.parent.as_str())
            })
            .collect()
    }

    /// Tables to reflect: the processing list, then tables only cascade rules name.
    pub fn tables_to_reflect(&self) -> Vec<String> {
        let mut tables = self.tables.clone();
        for rule in &self.cascade {
            for table in [&rule.parent, &rule.child] {
                if !tables.contains(table) {
                    tables.push(table.clone());
                }
            }
        }
        tables
    }
}

impl DatabaseConfig {
    /// The configured password, or `PGPASSWORD` when none is configured.
    pub fn resolved_password(&self) -> String {
        if self.password.is_empty() {
            std::env::var("PGPASSWORD").unwrap_or_default()
        } else {
            self.password.clone()
        }
    }
}
