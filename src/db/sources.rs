//! Per-source cursors and the processed-event ledger.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{ts, DbError, DbSourceCursor, MemoryDb};

/// Cursor ordering: numeric when both sides parse as integers, lexicographic
/// otherwise.
pub fn compare_cursors(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

impl MemoryDb {
    pub fn get_cursor(&self, source_id: &str) -> Result<Option<DbSourceCursor>, DbError> {
        let row = self
            .conn_ref()
            .query_row(
                "SELECT source_id, cursor, updated_at FROM source_cursors WHERE source_id = ?1",
                params![source_id],
                |row| {
                    Ok(DbSourceCursor {
                        source_id: row.get(0)?,
                        cursor: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Move the watermark forward. A cursor that does not sort after the
    /// stored one is ignored; returns whether the row changed.
    pub fn advance_cursor(&self, source_id: &str, cursor: &str) -> Result<bool, DbError> {
        if let Some(existing) = self.get_cursor(source_id)? {
            if compare_cursors(cursor, &existing.cursor) != Ordering::Greater {
                return Ok(false);
            }
        }
        self.conn_ref().execute(
            "INSERT INTO source_cursors (source_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![source_id, cursor, ts(&Utc::now())],
        )?;
        Ok(true)
    }

    pub fn is_processed(&self, source_id: &str, external_id: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn_ref()
            .query_row(
                "SELECT 1 FROM processed_events WHERE source_id = ?1 AND external_id = ?2",
                params![source_id, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record an event as handled. Replays of the same event are no-ops.
    pub fn mark_processed(
        &self,
        source_id: &str,
        external_id: &str,
        cursor: &str,
        entity_id: Option<&str>,
        processed_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let inserted = self.conn_ref().execute(
            "INSERT OR IGNORE INTO processed_events
                (source_id, external_id, cursor, entity_id, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source_id, external_id, cursor, entity_id, ts(processed_at)],
        )?;
        Ok(inserted > 0)
    }

    /// Entity an already-processed event was folded into.
    pub fn processed_entity(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<String>, DbError> {
        let entity: Option<Option<String>> = self
            .conn_ref()
            .query_row(
                "SELECT entity_id FROM processed_events WHERE source_id = ?1 AND external_id = ?2",
                params![source_id, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(entity.flatten())
    }

    /// Drop ledger rows older than `cutoff` whose entity no longer exists.
    pub fn prune_processed(&self, cutoff: &DateTime<Utc>) -> Result<usize, DbError> {
        let removed = self.conn_ref().execute(
            "DELETE FROM processed_events
             WHERE processed_at < ?1
               AND (entity_id IS NULL OR entity_id NOT IN (SELECT id FROM entities))",
            params![ts(cutoff)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    #[test]
    fn test_numeric_cursor_ordering() {
        assert_eq!(compare_cursors("10", "9"), Ordering::Greater);
        assert_eq!(compare_cursors("b", "a"), Ordering::Greater);
        assert_eq!(compare_cursors("7", "7"), Ordering::Equal);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let db = test_db();
        assert!(db.advance_cursor("mail", "10").expect("advance"));
        assert!(!db.advance_cursor("mail", "9").expect("stale"));
        assert!(!db.advance_cursor("mail", "10").expect("same"));
        assert_eq!(
            db.get_cursor("mail").expect("get").map(|c| c.cursor),
            Some("10".to_string())
        );
        assert!(db.advance_cursor("mail", "11").expect("advance"));
    }

    #[test]
    fn test_mark_processed_is_idempotent() {
        let db = test_db();
        let now = Utc::now();
        assert!(!db.is_processed("cal", "evt-1").expect("check"));
        assert!(db
            .mark_processed("cal", "evt-1", "1", Some("ent-1"), &now)
            .expect("mark"));
        assert!(!db
            .mark_processed("cal", "evt-1", "1", Some("ent-1"), &now)
            .expect("replay"));
        assert!(db.is_processed("cal", "evt-1").expect("check"));
        assert_eq!(
            db.processed_entity("cal", "evt-1").expect("entity"),
            Some("ent-1".to_string())
        );
    }
}
