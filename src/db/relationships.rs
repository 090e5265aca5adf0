//! Relationship edges.

use rusqlite::{params, Row};

use super::{parse_ts, ts, DbError, MemoryDb};
use crate::entity::{Relationship, RelationshipKind};

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, f64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_edge(
    (from_id, to_id, kind, confidence, discovered_at): (String, String, String, f64, String),
) -> Result<Relationship, DbError> {
    let kind = RelationshipKind::parse(&kind).ok_or_else(|| {
        DbError::CorruptRow(format!("edge {}->{}: unknown kind {}", from_id, to_id, kind))
    })?;
    Ok(Relationship {
        from_id,
        to_id,
        kind,
        confidence,
        discovered_at: parse_ts(&discovered_at)?,
    })
}

impl MemoryDb {
    /// Insert an edge, or raise the stored confidence when rediscovered.
    /// `discovered_at` keeps the first sighting.
    pub fn upsert_relationship(&self, rel: &Relationship) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO relationships (from_id, to_id, kind, confidence, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(from_id, to_id, kind) DO UPDATE SET
                confidence = MAX(relationships.confidence, excluded.confidence)",
            params![
                rel.from_id,
                rel.to_id,
                rel.kind.as_str(),
                rel.confidence.clamp(0.0, 1.0),
                ts(&rel.discovered_at),
            ],
        )?;
        Ok(())
    }

    /// Every edge touching any of `ids`, each edge once.
    pub fn relationships_for(&self, ids: &[String]) -> Result<Vec<Relationship>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT from_id, to_id, kind, confidence, discovered_at
             FROM relationships WHERE from_id = ?1 OR to_id = ?1",
        )?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for id in ids {
            let rows = stmt.query_map(params![id], edge_from_row)?;
            for row in rows {
                let edge = decode_edge(row?)?;
                if seen.insert((edge.from_id.clone(), edge.to_id.clone(), edge.kind)) {
                    out.push(edge);
                }
            }
        }
        Ok(out)
    }

    pub fn count_relationships(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
