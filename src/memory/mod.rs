//! Vector memory: the durable, searchable store of context entities.
//!
//! Writes are serialized through one writer connection. Reads go through a
//! separate read-only WAL connection so nearest-neighbour queries never wait
//! on ingestion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::{DbError, EntityFilter, MemoryDb};
use crate::embeddings::{cosine_similarity, embed_with_timeout, Embedder};
use crate::entity::{ContextEntity, Relationship};
use crate::error::PipelineError;
use crate::types::Config;

pub mod retention;

pub use retention::{CompactReport, PruneReport};

/// A query hit. `distance = 1 - cosine`.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub entity: ContextEntity,
    pub distance: f32,
}

/// Read-only access handed to detectors and the context engine.
pub trait MemoryView: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<ContextEntity>, DbError>;

    fn entities(
        &self,
        filter: &EntityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ContextEntity>, DbError>;

    fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<Neighbor>, DbError>;

    fn related(&self, entity_id: &str) -> Result<Vec<Relationship>, DbError>;

    fn find_by_source_ref(
        &self,
        entity_type: crate::entity::EntityType,
        source_ref: &str,
    ) -> Result<Option<String>, DbError>;
}

pub struct VectorMemory {
    writer: Mutex<MemoryDb>,
    reader: Mutex<MemoryDb>,
    path: PathBuf,
    config: Arc<Config>,
}

impl VectorMemory {
    /// Open the writer (running migrations) and then the read-only reader.
    pub fn open(path: PathBuf, config: Arc<Config>) -> Result<Self, DbError> {
        let writer = MemoryDb::open_at(path.clone())?;
        let reader = MemoryDb::open_readonly_at(&path)?;
        log::info!("Memory: opened {}", path.display());
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `f` against the writer connection.
    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&MemoryDb) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let db = self.writer.lock();
        f(&db)
    }

    /// Run `f` against the read-only connection.
    pub fn with_reader<T>(
        &self,
        f: impl FnOnce(&MemoryDb) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let db = self.reader.lock();
        f(&db)
    }

    /// Insert or replace an entity with its source refs in one transaction.
    ///
    /// Replacing an existing row moves `updated_at` to at least `now`.
    /// Returns the entity as stored.
    pub fn upsert(
        &self,
        entity: &ContextEntity,
        now: DateTime<Utc>,
    ) -> Result<ContextEntity, DbError> {
        let mut stored = entity.clone();
        stored.importance = stored.importance.clamp(0.0, 1.0);
        self.with_writer(|db| {
            db.with_transaction(|tx| {
                if tx.get_entity(&stored.entity_id)?.is_some() && stored.updated_at < now {
                    stored.updated_at = now;
                }
                tx.write_entity(&stored)
            })
        })?;
        log::debug!(
            "Memory: upserted {} {} ({} refs)",
            stored.entity_type,
            stored.entity_id,
            stored.source_refs.len()
        );
        Ok(stored)
    }

    /// Insert edges; rediscovered edges keep the higher confidence.
    pub fn upsert_relationships(&self, edges: &[Relationship]) -> Result<(), DbError> {
        if edges.is_empty() {
            return Ok(());
        }
        self.with_writer(|db| {
            db.with_transaction(|tx| {
                for edge in edges {
                    tx.upsert_relationship(edge)?;
                }
                Ok(())
            })
        })
    }

    pub fn relationships_for(&self, ids: &[String]) -> Result<Vec<Relationship>, DbError> {
        self.with_reader(|db| db.relationships_for(ids))
    }

    /// Nearest neighbours of `vector` among entities passing `filter`,
    /// ascending distance with ties broken by recency.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<Neighbor>, DbError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut filter = filter.clone();
        filter.require_embedding = true;
        let candidates = self.with_reader(|db| db.list_entities(&filter, None))?;

        let mut hits: Vec<Neighbor> = candidates
            .into_iter()
            .filter_map(|entity| {
                let distance = 1.0 - cosine_similarity(vector, entity.embedding.as_deref()?);
                Some(Neighbor { entity, distance })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| b.entity.updated_at.cmp(&a.entity.updated_at))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Embed `text` and query with the result.
    pub async fn query_text(
        &self,
        text: &str,
        k: usize,
        filter: &EntityFilter,
        embedder: &Arc<dyn Embedder>,
    ) -> Result<Vec<Neighbor>, PipelineError> {
        let vector = embed_with_timeout(embedder, text, self.config.embedding_timeout_secs).await?;
        Ok(self.query(&vector, k, filter)?)
    }

    pub fn count_entities(&self) -> Result<usize, DbError> {
        self.with_reader(|db| db.count_entities())
    }

    pub fn count_relationships(&self) -> Result<usize, DbError> {
        self.with_reader(|db| db.count_relationships())
    }
}

impl MemoryView for VectorMemory {
    fn get(&self, id: &str) -> Result<Option<ContextEntity>, DbError> {
        self.with_reader(|db| db.get_entity(id))
    }

    fn entities(
        &self,
        filter: &EntityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ContextEntity>, DbError> {
        self.with_reader(|db| db.list_entities(filter, limit))
    }

    fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<Neighbor>, DbError> {
        self.query(vector, k, filter)
    }

    fn related(&self, entity_id: &str) -> Result<Vec<Relationship>, DbError> {
        self.with_reader(|db| db.relationships_for(&[entity_id.to_string()]))
    }

    fn find_by_source_ref(
        &self,
        entity_type: crate::entity::EntityType,
        source_ref: &str,
    ) -> Result<Option<String>, DbError> {
        self.with_reader(|db| db.find_entity_by_source_ref(entity_type, source_ref))
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_memory;
    use super::*;
    use crate::entity::{EntityType, RelationshipKind};
    use chrono::Duration;

    pub(crate) fn entity(
        id: &str,
        entity_type: EntityType,
        embedding: Vec<f32>,
        updated_at: DateTime<Utc>,
    ) -> ContextEntity {
        ContextEntity {
            entity_id: id.to_string(),
            entity_type,
            created_at: updated_at,
            updated_at,
            source_refs: [format!("test:{}", id)].into_iter().collect(),
            importance: 0.5,
            embedding: Some(embedding),
            summary_text: format!("{} summary", id),
            attributes: Default::default(),
            embedding_pending: false,
            compacted: false,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let memory = test_memory();
        let now = Utc::now();
        let e = entity("a", EntityType::Task, vec![1.0, 0.0], now);
        memory.upsert(&e, now).expect("first");
        memory.upsert(&e, now).expect("second");
        assert_eq!(memory.count_entities().expect("count"), 1);
    }

    #[test]
    fn test_replace_bumps_updated_at() {
        let memory = test_memory();
        let then = Utc::now() - Duration::days(3);
        let now = Utc::now();
        let e = entity("a", EntityType::Task, vec![1.0, 0.0], then);
        let first = memory.upsert(&e, now).expect("insert");
        assert_eq!(first.updated_at, then);
        let second = memory.upsert(&e, now).expect("replace");
        assert_eq!(second.updated_at, now);
    }

    #[test]
    fn test_query_orders_by_distance_then_recency() {
        let memory = test_memory();
        let now = Utc::now();
        memory
            .upsert(&entity("far", EntityType::Task, vec![0.0, 1.0], now), now)
            .expect("far");
        memory
            .upsert(
                &entity("near-old", EntityType::Task, vec![1.0, 0.0], now - Duration::hours(2)),
                now,
            )
            .expect("near-old");
        memory
            .upsert(&entity("near-new", EntityType::Task, vec![1.0, 0.0], now), now)
            .expect("near-new");
        memory
            .upsert(&entity("meeting", EntityType::Meeting, vec![1.0, 0.0], now), now)
            .expect("meeting");

        let hits = memory
            .query(&[1.0, 0.0], 2, &EntityFilter::of_type(EntityType::Task))
            .expect("query");
        let ids: Vec<&str> = hits.iter().map(|h| h.entity.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["near-new", "near-old"]);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_min_importance_filter() {
        let memory = test_memory();
        let now = Utc::now();
        let mut low = entity("low", EntityType::Task, vec![1.0, 0.0], now);
        low.importance = 0.1;
        memory.upsert(&low, now).expect("low");
        memory
            .upsert(&entity("mid", EntityType::Task, vec![1.0, 0.0], now), now)
            .expect("mid");
        let hits = memory
            .query(&[1.0, 0.0], 10, &EntityFilter::default().min_importance(0.3))
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.entity_id, "mid");
    }

    #[test]
    fn test_related_edges_visible_to_reader() {
        let memory = test_memory();
        let now = Utc::now();
        memory
            .upsert(&entity("a", EntityType::Task, vec![1.0, 0.0], now), now)
            .expect("a");
        memory
            .upsert(&entity("b", EntityType::Project, vec![1.0, 0.0], now), now)
            .expect("b");
        memory
            .upsert_relationships(&[Relationship::new(
                "a",
                "b",
                RelationshipKind::PartOf,
                0.9,
                now,
            )])
            .expect("edge");
        let edges = memory.related("b").expect("related");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].other("b"), "a");
    }

    #[tokio::test]
    async fn test_query_text_uses_embedder() {
        use crate::embeddings::HashEmbedder;
        let memory = test_memory();
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let now = Utc::now();
        let v = embedder.embed("budget review").await.expect("embed");
        memory
            .upsert(&entity("budget", EntityType::Meeting, v, now), now)
            .expect("upsert");
        let hits = memory
            .query_text("Budget Review", 1, &EntityFilter::default(), &embedder)
            .await
            .expect("query");
        assert_eq!(hits[0].entity.entity_id, "budget");
    }
}
