//! Extraction: classify, score, embed, resolve, merge, persist, link.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{classify, importance, relationships, resolve, KeyedLocks};
use crate::embeddings::{embed_with_timeout, Embedder};
use crate::entity::{ContextEntity, EntityType, Relationship};
use crate::error::PipelineError;
use crate::memory::VectorMemory;
use crate::normalizer::NormalizedEvent;
use crate::types::Config;

/// Result of folding one event into memory.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// The entity as persisted.
    pub entity: ContextEntity,
    pub relationships: Vec<Relationship>,
    /// True when the event merged into an existing entity.
    pub merged: bool,
}

pub struct ContextEngine {
    memory: Arc<VectorMemory>,
    embedder: Arc<dyn Embedder>,
    config: Arc<Config>,
    locks: KeyedLocks<EntityType>,
}

impl ContextEngine {
    pub fn new(memory: Arc<VectorMemory>, embedder: Arc<dyn Embedder>, config: Arc<Config>) -> Self {
        Self {
            memory,
            embedder,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn memory(&self) -> &Arc<VectorMemory> {
        &self.memory
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Build an unsaved entity for `event`. Embedding failures leave the
    /// vector empty and mark it for backfill.
    pub async fn candidate(&self, event: &NormalizedEvent, now: DateTime<Utc>) -> ContextEntity {
        let entity_type = classify::classify(event);
        let text = event.text();
        let importance = importance::score(
            &self.config.importance,
            event.timestamp,
            now,
            &event.attributes,
            &text,
        );

        let embedding =
            match embed_with_timeout(&self.embedder, &text, self.config.embedding_timeout_secs)
                .await
            {
                Ok(vector) => Some(vector),
                Err(e) => {
                    log::warn!(
                        "Context: embedding {} via {} failed, deferring: {}",
                        event.source_ref(),
                        self.embedder.name(),
                        e
                    );
                    None
                }
            };

        ContextEntity {
            entity_id: format!("ent-{}", Uuid::new_v4()),
            entity_type,
            created_at: event.timestamp,
            updated_at: event.timestamp,
            source_refs: [event.source_ref()].into_iter().collect(),
            importance,
            embedding_pending: embedding.is_none(),
            embedding,
            summary_text: text.chars().take(self.config.max_summary_chars).collect(),
            attributes: event.attributes.clone(),
            compacted: false,
        }
    }

    /// Fold `event` into memory and discover its relationships.
    pub async fn extract(
        &self,
        event: &NormalizedEvent,
        now: DateTime<Utc>,
    ) -> Result<Extraction, PipelineError> {
        let candidate = self.candidate(event, now).await;

        let _guard = self.locks.lock(&candidate.entity_type).await;

        let resolved =
            resolve::resolve(self.memory.as_ref(), &self.config, &candidate, event.timestamp)?;
        let (to_write, merged) = match resolved {
            Some((existing, by)) => {
                log::debug!(
                    "Context: {} resolves to {} by {}",
                    event.source_ref(),
                    existing.entity_id,
                    by.label()
                );
                (
                    resolve::merge(
                        &existing,
                        &candidate,
                        event.timestamp,
                        self.config.max_summary_chars,
                    ),
                    true,
                )
            }
            None => (candidate, false),
        };

        let entity = self.memory.upsert(&to_write, now)?;
        let edges = relationships::discover(
            self.memory.as_ref(),
            &self.config,
            &entity,
            &event.references,
            now,
        )?;
        self.memory.upsert_relationships(&edges)?;

        Ok(Extraction {
            entity,
            relationships: edges,
            merged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{FailingEmbedder, HashEmbedder};
    use crate::memory::test_utils::test_memory;
    use crate::memory::MemoryView;
    use crate::normalizer::{parse_payload, RawEvent};
    use chrono::TimeZone;
    use serde_json::json;

    fn engine_with(embedder: Arc<dyn Embedder>) -> ContextEngine {
        ContextEngine::new(
            Arc::new(test_memory()),
            embedder,
            Arc::new(Config::default()),
        )
    }

    fn event(source: &str, id: &str, payload: serde_json::Value) -> NormalizedEvent {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        parse_payload(&RawEvent::new(source, id, at, payload, "1")).expect("valid")
    }

    #[tokio::test]
    async fn test_resubmitted_event_yields_one_entity() {
        let engine = engine_with(Arc::new(HashEmbedder::default()));
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 5, 0).unwrap();
        let e = event("calendar", "evt-1", json!({"title": "Board prep", "attendees": ["ana"]}));

        let first = engine.extract(&e, now).await.expect("first");
        let second = engine.extract(&e, now).await.expect("second");
        assert!(!first.merged);
        assert!(second.merged);
        assert_eq!(first.entity.entity_id, second.entity.entity_id);
        assert_eq!(engine.memory().count_entities().expect("count"), 1);
        assert_eq!(engine.memory().count_relationships().expect("count"), 0);
    }

    #[tokio::test]
    async fn test_similar_events_merge_across_sources() {
        let engine = engine_with(Arc::new(HashEmbedder::default()));
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 5, 0).unwrap();
        let a = event("calendar", "evt-1", json!({"title": "Quarterly budget review", "type": "meeting"}));
        let b = event("outlook", "x-9", json!({"title": "Quarterly Budget Review", "type": "meeting"}));

        let first = engine.extract(&a, now).await.expect("a");
        let second = engine.extract(&b, now).await.expect("b");
        assert!(second.merged);
        assert_eq!(first.entity.entity_id, second.entity.entity_id);
        assert_eq!(second.entity.source_refs.len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_marks_pending() {
        let engine = engine_with(Arc::new(FailingEmbedder));
        let now = Utc::now();
        let e = event("jira", "T-1", json!({"title": "Fix login bug"}));
        let out = engine.extract(&e, now).await.expect("extract");
        assert!(out.entity.embedding_pending);
        assert!(out.entity.embedding.is_none());
        let stored = engine
            .memory()
            .get(&out.entity.entity_id)
            .expect("get")
            .expect("persisted");
        assert_eq!(stored.entity_type, EntityType::Task);
    }

    #[tokio::test]
    async fn test_explicit_reference_links_entities() {
        let engine = engine_with(Arc::new(HashEmbedder::default()));
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 5, 0).unwrap();
        let doc = event("drive", "doc-1", json!({"title": "Launch deck", "type": "document"}));
        let meeting = event(
            "calendar",
            "evt-7",
            json!({"title": "Launch sync", "references": ["drive:doc-1"]}),
        );
        let doc_out = engine.extract(&doc, now).await.expect("doc");
        let meeting_out = engine.extract(&meeting, now).await.expect("meeting");
        assert!(meeting_out
            .relationships
            .iter()
            .any(|r| r.to_id == doc_out.entity.entity_id));
    }
}
