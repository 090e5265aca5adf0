//! SQLite-backed persistence for the context memory and triage state.
//!
//! The database lives at `~/.foresight/foresight.db` and holds every piece of
//! state that must survive a restart: entities and their source refs,
//! relationship edges, alert records, the feedback log, per-source cursors,
//! the processed-event ledger and the active triage model.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};

pub mod types;
pub use types::*;

pub struct MemoryDb {
    conn: Connection,
}

impl MemoryDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.foresight/foresight.db` and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the read-only query connection run alongside the writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn)?;

        // Relationship cascade depends on FK enforcement.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Open a database at an explicit path in read-only mode. Used for
    /// nearest-neighbour queries so reads never wait on the writer.
    pub fn open_readonly_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.foresight/foresight.db`.
    pub fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".foresight").join("foresight.db"))
    }

    /// Filesystem path of the main database file.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// Canonical timestamp encoding. Fixed width so text comparison in SQL
/// matches chronological order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`ts`] (or any RFC3339 string).
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::CorruptRow(format!("bad timestamp '{}': {}", s, e)))
}

pub mod alerts;
pub mod entities;
pub mod models;
pub mod relationships;
pub mod sources;

pub use alerts::DbFeedback;
pub use entities::EntityFilter;
pub use sources::compare_cursors;

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::MemoryDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    /// Test temp dirs are cleaned up by the OS.
    pub fn test_db() -> MemoryDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        MemoryDb::open_at(path).expect("Failed to open test database")
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in [
            "entities",
            "entity_source_refs",
            "relationships",
            "alerts",
            "feedback",
            "source_cursors",
            "processed_events",
            "triage_models",
            "retrain_state",
        ] {
            let count: i64 = db
                .conn_ref()
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap_or_else(|e| panic!("{} should exist: {}", table, e));
            assert!(count >= 0);
        }
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("persist.db");
        {
            let db = MemoryDb::open_at(path.clone()).expect("open");
            db.advance_cursor("calendar", "42").expect("cursor");
        }
        let db = MemoryDb::open_at(path).expect("reopen");
        let cursor = db.get_cursor("calendar").expect("get");
        assert_eq!(cursor.map(|c| c.cursor), Some("42".to_string()));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.advance_cursor("mail", "7")?;
            Err(DbError::CorruptRow("forced".to_string()))
        });
        assert!(result.is_err());
        assert!(db.get_cursor("mail").expect("get").is_none());
    }

    #[test]
    fn test_ts_sorts_chronologically() {
        let a = DateTime::parse_from_rfc3339("2026-01-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-10T08:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&b)).unwrap(), b);
    }
}
