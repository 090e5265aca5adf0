//! Relationship discovery between a freshly written entity and its recent
//! neighbours.
//!
//! Signal producers:
//! 1. Explicit references carried by the event
//! 2. Shared participants (Jaccard overlap)
//! 3. Embedding similarity
//!
//! Per target the signals are fused with weighted log-odds, so two weak
//! signals can clear the threshold one alone would miss.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::db::{DbError, EntityFilter};
use crate::embeddings::cosine_similarity;
use crate::entity::{ContextEntity, EntityType, Relationship, RelationshipKind};
use crate::memory::MemoryView;
use crate::normalizer::EventReference;
use crate::signals::fusion::fuse_confidence;
use crate::types::Config;

const EXPLICIT_CONFIDENCE: f64 = 0.95;

const WEIGHT_EXPLICIT: f64 = 1.0;
const WEIGHT_PARTICIPANTS: f64 = 0.8;
const WEIGHT_SIMILARITY: f64 = 0.9;

/// A single relationship signal toward one target.
#[derive(Debug, Clone)]
struct LinkSignal {
    confidence: f64,
    weight: f64,
    explicit_kind: Option<RelationshipKind>,
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Edges between `entity` and existing entities. Never returns self edges.
pub fn discover(
    memory: &dyn MemoryView,
    config: &Config,
    entity: &ContextEntity,
    references: &[EventReference],
    now: DateTime<Utc>,
) -> Result<Vec<Relationship>, DbError> {
    let mut signals: BTreeMap<String, Vec<LinkSignal>> = BTreeMap::new();
    let mut targets: BTreeMap<String, ContextEntity> = BTreeMap::new();

    for reference in references {
        let source_ref = reference.source_ref();
        if entity.source_refs.contains(&source_ref) {
            continue;
        }
        if let Some(target) = lookup_any_type(memory, &source_ref)? {
            if target.entity_id == entity.entity_id {
                continue;
            }
            signals
                .entry(target.entity_id.clone())
                .or_default()
                .push(LinkSignal {
                    confidence: EXPLICIT_CONFIDENCE,
                    weight: WEIGHT_EXPLICIT,
                    explicit_kind: Some(reference.kind),
                });
            targets.insert(target.entity_id.clone(), target);
        }
    }

    let window = Duration::days(config.relationship_window_days.max(0));
    let recent = memory.entities(
        &EntityFilter::default().since(now - window),
        Some(config.relationship_scan_limit),
    )?;
    let participants = entity.participants();

    for other in recent {
        if other.entity_id == entity.entity_id {
            continue;
        }
        let mut found = Vec::new();

        let theirs = other.participants();
        let overlap = jaccard(&participants, &theirs);
        if overlap > 0.0 {
            found.push(LinkSignal {
                confidence: 0.5 + 0.45 * overlap,
                weight: WEIGHT_PARTICIPANTS,
                explicit_kind: None,
            });
        }

        if let (Some(a), Some(b)) = (entity.embedding.as_deref(), other.embedding.as_deref()) {
            let similarity = cosine_similarity(a, b) as f64;
            if similarity >= config.relationship_threshold {
                found.push(LinkSignal {
                    confidence: similarity,
                    weight: WEIGHT_SIMILARITY,
                    explicit_kind: None,
                });
            }
        }

        if !found.is_empty() {
            signals
                .entry(other.entity_id.clone())
                .or_default()
                .extend(found);
            targets.entry(other.entity_id.clone()).or_insert(other);
        }
    }

    let mut edges = Vec::new();
    for (target_id, target_signals) in signals {
        let Some(target) = targets.get(&target_id) else {
            continue;
        };
        let explicit_kind = target_signals.iter().find_map(|s| s.explicit_kind);
        let pairs: Vec<(f64, f64)> = target_signals
            .iter()
            .map(|s| (s.confidence, s.weight))
            .collect();
        let confidence = fuse_confidence(&pairs).max(if explicit_kind.is_some() {
            EXPLICIT_CONFIDENCE
        } else {
            0.0
        });
        if explicit_kind.is_none() && confidence < config.relationship_threshold {
            continue;
        }

        let shares_participants = !participants.is_disjoint(&target.participants());
        let (from, to, kind) = match explicit_kind {
            Some(kind) => (entity, target, kind),
            None => infer_kind(entity, target, shares_participants),
        };
        if from.entity_id == to.entity_id {
            continue;
        }
        edges.push(Relationship::new(
            &from.entity_id,
            &to.entity_id,
            kind,
            confidence,
            now,
        ));
    }

    Ok(edges)
}

/// Direction and kind for an implicit link.
fn infer_kind<'a>(
    entity: &'a ContextEntity,
    other: &'a ContextEntity,
    shares_participants: bool,
) -> (&'a ContextEntity, &'a ContextEntity, RelationshipKind) {
    match (entity.entity_type, other.entity_type) {
        (EntityType::Project, EntityType::Project) => (entity, other, RelationshipKind::Mentions),
        (_, EntityType::Project) => (entity, other, RelationshipKind::PartOf),
        (EntityType::Project, _) => (other, entity, RelationshipKind::PartOf),
        (EntityType::Communication, EntityType::Communication) if shares_participants => {
            if other.updated_at <= entity.updated_at {
                (entity, other, RelationshipKind::Follows)
            } else {
                (other, entity, RelationshipKind::Follows)
            }
        }
        _ => (entity, other, RelationshipKind::Mentions),
    }
}

fn lookup_any_type(
    memory: &dyn MemoryView,
    source_ref: &str,
) -> Result<Option<ContextEntity>, DbError> {
    for entity_type in EntityType::ALL {
        if let Some(id) = memory.find_by_source_ref(entity_type, source_ref)? {
            return memory.get(&id);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AttrValue, Attributes};
    use crate::memory::test_utils::test_memory;

    fn entity(
        id: &str,
        entity_type: EntityType,
        participants: &str,
        embedding: Vec<f32>,
        at: DateTime<Utc>,
    ) -> ContextEntity {
        let mut attributes = Attributes::new();
        if !participants.is_empty() {
            attributes.insert(
                "participants".to_string(),
                AttrValue::Text(participants.to_string()),
            );
        }
        ContextEntity {
            entity_id: id.to_string(),
            entity_type,
            created_at: at,
            updated_at: at,
            source_refs: [format!("src:{}", id)].into_iter().collect(),
            importance: 0.5,
            embedding: Some(embedding),
            summary_text: id.to_string(),
            attributes,
            embedding_pending: false,
            compacted: false,
        }
    }

    #[test]
    fn test_jaccard() {
        let a: BTreeSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["y", "z"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_explicit_reference_creates_edge() {
        let memory = test_memory();
        let now = Utc::now();
        let doc = entity("doc", EntityType::Task, "", vec![0.0, 1.0], now);
        memory.upsert(&doc, now).expect("doc");
        let meeting = entity("meet", EntityType::Meeting, "", vec![1.0, 0.0], now);
        memory.upsert(&meeting, now).expect("meeting");

        let refs = vec![EventReference {
            kind: RelationshipKind::Mentions,
            source_id: "src".to_string(),
            external_id: "doc".to_string(),
        }];
        let edges = discover(&memory, &Config::default(), &meeting, &refs, now).expect("discover");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_id, "meet");
        assert_eq!(edges[0].to_id, "doc");
        assert!(edges[0].confidence >= 0.95);
    }

    #[test]
    fn test_similarity_links_task_to_project() {
        let memory = test_memory();
        let now = Utc::now();
        let project = entity("proj", EntityType::Project, "", vec![1.0, 0.1], now);
        memory.upsert(&project, now).expect("project");
        let task = entity("task", EntityType::Task, "", vec![1.0, 0.0], now);
        memory.upsert(&task, now).expect("task");

        let edges = discover(&memory, &Config::default(), &task, &[], now).expect("discover");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationshipKind::PartOf);
        assert_eq!(edges[0].from_id, "task");
        assert_eq!(edges[0].to_id, "proj");
    }

    #[test]
    fn test_follows_for_threaded_communication() {
        let memory = test_memory();
        let now = Utc::now();
        let first = entity(
            "mail-1",
            EntityType::Communication,
            "ana@x.com,bo@x.com",
            vec![0.0, 1.0],
            now - Duration::hours(2),
        );
        memory.upsert(&first, now).expect("first");
        let reply = entity(
            "mail-2",
            EntityType::Communication,
            "ana@x.com,bo@x.com",
            vec![1.0, 0.0],
            now,
        );
        memory.upsert(&reply, now).expect("reply");

        let edges = discover(&memory, &Config::default(), &reply, &[], now).expect("discover");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationshipKind::Follows);
        assert_eq!(edges[0].from_id, "mail-2");
        assert_eq!(edges[0].to_id, "mail-1");
    }

    #[test]
    fn test_unrelated_entities_stay_unlinked() {
        let memory = test_memory();
        let now = Utc::now();
        let a = entity("a", EntityType::Task, "ana", vec![1.0, 0.0], now);
        let b = entity("b", EntityType::Task, "bo", vec![0.0, 1.0], now);
        memory.upsert(&a, now).expect("a");
        memory.upsert(&b, now).expect("b");
        let edges = discover(&memory, &Config::default(), &a, &[], now).expect("discover");
        assert!(edges.is_empty());
    }
}
