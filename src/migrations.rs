//! Embedded schema migrations, applied in order on open.
//!
//! `schema_version` holds one row per applied step. Each step and its
//! version row commit together.

use rusqlite::{Connection, DatabaseName};

use crate::db::DbError;

/// `(version, sql)`, ascending.
const STEPS: &[(u32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn fail(context: &str, e: rusqlite::Error) -> DbError {
    DbError::Migration(format!("{}: {}", context, e))
}

fn applied_version(conn: &Connection) -> Result<u32, DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| fail("schema_version", e))?;
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| fail("read schema version", e))
}

/// Copy a populated file database to `<path>.pre-migration.bak`.
fn snapshot(conn: &Connection) -> Result<(), DbError> {
    let Some(path) = conn.path().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let target = format!("{}.pre-migration.bak", path);
    conn.backup(DatabaseName::Main, &target, None)
        .map_err(|e| fail("pre-migration backup", e))?;
    log::info!("Memory: schema backup written to {}", target);
    Ok(())
}

/// Bring the schema up to date. Returns how many steps ran.
///
/// A database written by a newer build is refused rather than touched.
pub fn run_migrations(conn: &Connection) -> Result<usize, DbError> {
    let current = applied_version(conn)?;
    let latest = STEPS.last().map(|(v, _)| *v).unwrap_or(0);
    if current > latest {
        return Err(DbError::Migration(format!(
            "schema v{} is newer than this build (v{}); upgrade foresight",
            current, latest
        )));
    }

    let pending: Vec<&(u32, &str)> = STEPS.iter().filter(|(v, _)| *v > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn)?;
    }

    for (version, sql) in &pending {
        let context = format!("step v{}", version);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| fail(&context, e))?;
        tx.execute_batch(sql).map_err(|e| fail(&context, e))?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
            .map_err(|e| fail(&context, e))?;
        tx.commit().map_err(|e| fail(&context, e))?;
        log::info!("Memory: schema at v{}", version);
    }
    Ok(pending.len())
}
