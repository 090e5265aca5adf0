//! Entity rows and their source refs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, Row};

use super::{parse_ts, ts, DbError, MemoryDb};
use crate::embeddings::{blob_to_f32_vec, f32_vec_to_blob};
use crate::entity::{Attributes, ContextEntity, EntityType};

const REF_SEPARATOR: char = '\u{1f}';

const ENTITY_COLUMNS: &str = "e.id, e.entity_type, e.created_at, e.updated_at, e.importance,
    e.embedding, e.summary_text, e.attributes_json, e.embedding_pending, e.compacted,
    (SELECT group_concat(r.source_ref, char(31)) FROM entity_source_refs r WHERE r.entity_id = e.id)";

/// Metadata filter applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub types: Option<Vec<EntityType>>,
    pub updated_since: Option<DateTime<Utc>>,
    pub updated_until: Option<DateTime<Utc>>,
    pub min_importance: Option<f64>,
    pub require_embedding: bool,
}

impl EntityFilter {
    pub fn of_type(entity_type: EntityType) -> Self {
        Self {
            types: Some(vec![entity_type]),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.updated_until = Some(until);
        self
    }

    pub fn min_importance(mut self, floor: f64) -> Self {
        self.min_importance = Some(floor);
        self
    }

    /// Build the WHERE clause and its bound values.
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(types) = &self.types {
            if types.is_empty() {
                clauses.push("0".to_string());
            } else {
                let marks: Vec<String> = types
                    .iter()
                    .map(|t| {
                        values.push(Value::Text(t.as_str().to_string()));
                        format!("?{}", values.len())
                    })
                    .collect();
                clauses.push(format!("e.entity_type IN ({})", marks.join(", ")));
            }
        }
        if let Some(since) = &self.updated_since {
            values.push(Value::Text(ts(since)));
            clauses.push(format!("e.updated_at >= ?{}", values.len()));
        }
        if let Some(until) = &self.updated_until {
            values.push(Value::Text(ts(until)));
            clauses.push(format!("e.updated_at <= ?{}", values.len()));
        }
        if let Some(floor) = self.min_importance {
            values.push(Value::Real(floor));
            clauses.push(format!("e.importance >= ?{}", values.len()));
        }
        if self.require_embedding {
            clauses.push("e.embedding IS NOT NULL".to_string());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (where_sql, values)
    }
}

/// Raw column values; decoded outside the rusqlite row closure so bad data
/// surfaces as `DbError::CorruptRow` instead of a panic.
struct EntityRow {
    id: String,
    entity_type: String,
    created_at: String,
    updated_at: String,
    importance: f64,
    embedding: Option<Vec<u8>>,
    summary_text: String,
    attributes_json: String,
    embedding_pending: bool,
    compacted: bool,
    refs: Option<String>,
}

impl EntityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            importance: row.get(4)?,
            embedding: row.get(5)?,
            summary_text: row.get(6)?,
            attributes_json: row.get(7)?,
            embedding_pending: row.get::<_, i64>(8)? != 0,
            compacted: row.get::<_, i64>(9)? != 0,
            refs: row.get(10)?,
        })
    }

    fn decode(self) -> Result<ContextEntity, DbError> {
        let entity_type = EntityType::parse(&self.entity_type).ok_or_else(|| {
            DbError::CorruptRow(format!("entity {}: unknown type {}", self.id, self.entity_type))
        })?;
        let attributes: Attributes = serde_json::from_str(&self.attributes_json)
            .map_err(|e| DbError::CorruptRow(format!("entity {} attributes: {}", self.id, e)))?;
        let embedding = match self.embedding {
            Some(blob) => Some(
                blob_to_f32_vec(&blob)
                    .map_err(|e| DbError::CorruptRow(format!("entity {}: {}", self.id, e)))?,
            ),
            None => None,
        };
        let source_refs: BTreeSet<String> = self
            .refs
            .map(|s| s.split(REF_SEPARATOR).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(ContextEntity {
            entity_id: self.id,
            entity_type,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            source_refs,
            importance: self.importance,
            embedding,
            summary_text: self.summary_text,
            attributes,
            embedding_pending: self.embedding_pending,
            compacted: self.compacted,
        })
    }
}

impl MemoryDb {
    /// Insert or replace an entity row and its source refs.
    ///
    /// Callers wrap this in `with_transaction` so the row and its refs land
    /// together.
    pub fn write_entity(&self, entity: &ContextEntity) -> Result<(), DbError> {
        let attributes_json = serde_json::to_string(&entity.attributes)
            .map_err(|e| DbError::CorruptRow(format!("attributes: {}", e)))?;
        let embedding = entity.embedding.as_deref().map(f32_vec_to_blob);

        self.conn_ref().execute(
            "INSERT INTO entities
                (id, entity_type, created_at, updated_at, importance, embedding,
                 summary_text, attributes_json, embedding_pending, compacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                entity_type = excluded.entity_type,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                importance = excluded.importance,
                embedding = excluded.embedding,
                summary_text = excluded.summary_text,
                attributes_json = excluded.attributes_json,
                embedding_pending = excluded.embedding_pending,
                compacted = excluded.compacted",
            params![
                entity.entity_id,
                entity.entity_type.as_str(),
                ts(&entity.created_at),
                ts(&entity.updated_at),
                entity.importance.clamp(0.0, 1.0),
                embedding,
                entity.summary_text,
                attributes_json,
                entity.embedding_pending as i64,
                entity.compacted as i64,
            ],
        )?;

        self.conn_ref().execute(
            "DELETE FROM entity_source_refs WHERE entity_id = ?1",
            params![entity.entity_id],
        )?;
        for source_ref in &entity.source_refs {
            // A ref already owned by another entity of this type moves here;
            // resolution merges before that can happen, so this only repairs.
            self.conn_ref().execute(
                "INSERT INTO entity_source_refs (source_ref, entity_type, entity_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_ref, entity_type) DO UPDATE SET entity_id = excluded.entity_id",
                params![source_ref, entity.entity_type.as_str(), entity.entity_id],
            )?;
        }
        Ok(())
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<ContextEntity>, DbError> {
        let sql = format!("SELECT {} FROM entities e WHERE e.id = ?1", ENTITY_COLUMNS);
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], EntityRow::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.decode()?)),
            None => Ok(None),
        }
    }

    pub fn get_entities(&self, ids: &[String]) -> Result<Vec<ContextEntity>, DbError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get_entity(id)? {
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Entity of `entity_type` that already absorbed `source_ref`, if any.
    pub fn find_entity_by_source_ref(
        &self,
        entity_type: EntityType,
        source_ref: &str,
    ) -> Result<Option<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT entity_id FROM entity_source_refs WHERE source_ref = ?1 AND entity_type = ?2",
        )?;
        let mut rows = stmt.query_map(params![source_ref, entity_type.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        match rows.next() {
            Some(id) => Ok(Some(id?)),
            None => Ok(None),
        }
    }

    /// Entities matching `filter`, most recently updated first.
    pub fn list_entities(
        &self,
        filter: &EntityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ContextEntity>, DbError> {
        let (where_sql, values) = filter.to_sql();
        let limit_sql = limit.map(|n| format!("LIMIT {}", n)).unwrap_or_default();
        let sql = format!(
            "SELECT {} FROM entities e {} ORDER BY e.updated_at DESC, e.id {}",
            ENTITY_COLUMNS, where_sql, limit_sql
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), EntityRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Ids of entities older than `cutoff` with importance below `floor`.
    pub fn prune_candidates(
        &self,
        cutoff: &DateTime<Utc>,
        floor: f64,
    ) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT id FROM entities WHERE updated_at < ?1 AND importance < ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![ts(cutoff), floor], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Entities older than `cutoff` whose importance sits in `[floor, ceiling)`
    /// and that have not been compacted yet.
    pub fn compaction_candidates(
        &self,
        cutoff: &DateTime<Utc>,
        floor: f64,
        ceiling: f64,
    ) -> Result<Vec<ContextEntity>, DbError> {
        let sql = format!(
            "SELECT {} FROM entities e
             WHERE e.updated_at < ?1 AND e.importance >= ?2 AND e.importance < ?3
               AND e.compacted = 0
             ORDER BY e.updated_at",
            ENTITY_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![ts(cutoff), floor, ceiling], EntityRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    pub fn pending_embeddings(&self, limit: usize) -> Result<Vec<ContextEntity>, DbError> {
        let sql = format!(
            "SELECT {} FROM entities e WHERE e.embedding_pending = 1 ORDER BY e.updated_at DESC LIMIT ?1",
            ENTITY_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], EntityRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Attach a vector without touching `updated_at`. Skipped (returns false)
    /// when the row was rewritten after `expected_updated_at` was read.
    pub fn set_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        expected_updated_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let changed = self.conn_ref().execute(
            "UPDATE entities SET embedding = ?1, embedding_pending = 0
             WHERE id = ?2 AND updated_at = ?3",
            params![f32_vec_to_blob(embedding), id, ts(expected_updated_at)],
        )?;
        Ok(changed > 0)
    }

    /// Delete entities and every edge that references them.
    pub fn delete_entities(&self, ids: &[String]) -> Result<(usize, usize), DbError> {
        let mut entities = 0;
        let mut edges = 0;
        for id in ids {
            edges += self.conn_ref().execute(
                "DELETE FROM relationships WHERE from_id = ?1 OR to_id = ?1",
                params![id],
            )?;
            entities += self
                .conn_ref()
                .execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        }
        Ok((entities, edges))
    }

    pub fn count_entities(&self) -> Result<usize, DbError> {
        let n: i64 = self
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::entity::AttrValue;
    use chrono::Duration;

    fn sample(id: &str, entity_type: EntityType, updated_at: DateTime<Utc>) -> ContextEntity {
        let mut attributes = Attributes::new();
        attributes.insert("title".to_string(), AttrValue::Text(format!("{} title", id)));
        ContextEntity {
            entity_id: id.to_string(),
            entity_type,
            created_at: updated_at,
            updated_at,
            source_refs: [format!("src:{}", id)].into_iter().collect(),
            importance: 0.5,
            embedding: Some(vec![1.0, 0.0, 0.0]),
            summary_text: format!("{} summary", id),
            attributes,
            embedding_pending: false,
            compacted: false,
        }
    }

    #[test]
    fn test_write_and_read_entity() {
        let db = test_db();
        let now = Utc::now();
        let entity = sample("e1", EntityType::Meeting, now);
        db.write_entity(&entity).expect("write");

        let loaded = db.get_entity("e1").expect("get").expect("exists");
        assert_eq!(loaded.entity_type, EntityType::Meeting);
        assert_eq!(loaded.source_refs, entity.source_refs);
        assert_eq!(loaded.embedding, entity.embedding);
        assert_eq!(loaded.title(), "e1 title");
    }

    #[test]
    fn test_source_ref_lookup_is_type_scoped() {
        let db = test_db();
        db.write_entity(&sample("e1", EntityType::Task, Utc::now()))
            .expect("write");
        assert_eq!(
            db.find_entity_by_source_ref(EntityType::Task, "src:e1")
                .expect("lookup"),
            Some("e1".to_string())
        );
        assert_eq!(
            db.find_entity_by_source_ref(EntityType::Meeting, "src:e1")
                .expect("lookup"),
            None
        );
    }

    #[test]
    fn test_list_entities_filters() {
        let db = test_db();
        let now = Utc::now();
        db.write_entity(&sample("old", EntityType::Meeting, now - Duration::days(10)))
            .expect("write");
        db.write_entity(&sample("new", EntityType::Meeting, now))
            .expect("write");
        db.write_entity(&sample("task", EntityType::Task, now))
            .expect("write");

        let filter = EntityFilter::of_type(EntityType::Meeting).since(now - Duration::days(1));
        let found = db.list_entities(&filter, None).expect("list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, "new");

        let all = db.list_entities(&EntityFilter::default(), Some(2)).expect("list");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_corrupt_type_surfaces_as_error() {
        let db = test_db();
        db.conn_ref()
            .execute(
                "INSERT INTO entities (id, entity_type, created_at, updated_at, importance)
                 VALUES ('bad', 'account', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 0.1)",
                [],
            )
            .expect("insert");
        let err = db.get_entity("bad").expect_err("should fail to decode");
        assert!(err.is_corruption());
    }
}
