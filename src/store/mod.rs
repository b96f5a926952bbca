pub mod beads;
pub mod coordination;
pub mod events;
pub mod graph;
pub mod projections;

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::Result;

/// The process-wide coordination store. Owns the database; every logical
/// operation opens its own transaction on the shared connection.
pub struct HiveStore {
    db: Database,
}

impl HiveStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_memory()?,
        })
    }

    /// Open `<repo_root>/.hive/hive.db`.
    pub fn from_repo(repo_root: &Path) -> Result<Self> {
        Ok(Self {
            db: Database::from_repo(repo_root)?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

/// Parse an RFC 3339 timestamp from a SQLite TEXT column.
pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_dt(&v))
}

/// Parse a JSON array column into a string vector; empty on NULL/garbage.
pub(crate) fn parse_string_array(s: Option<String>) -> Vec<String> {
    s.and_then(|v| serde_json::from_str(&v).ok())
        .unwrap_or_default()
}
