//! Entity resolution: decide whether an incoming event describes an entity
//! memory already holds, and merge it if so.
//!
//! Signal cascade, first hit wins:
//! 1. Exact source ref (same type)
//! 2. Embedding similarity within the resolution window
//! 3. Title similarity within the window, for pairs lacking vectors

use chrono::{DateTime, Duration, Utc};

use crate::db::{DbError, EntityFilter};
use crate::embeddings::mean_vector;
use crate::entity::ContextEntity;
use crate::memory::MemoryView;
use crate::types::Config;

/// How many nearest neighbours to inspect before giving up on a vector match.
const NEIGHBOUR_K: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedBy {
    SourceRef,
    Embedding(f32),
    Title(f64),
}

impl ResolvedBy {
    pub fn label(&self) -> &'static str {
        match self {
            ResolvedBy::SourceRef => "source_ref",
            ResolvedBy::Embedding(_) => "embedding",
            ResolvedBy::Title(_) => "title",
        }
    }
}

/// Find the stored entity `candidate` should merge into, if any.
pub fn resolve(
    memory: &dyn MemoryView,
    config: &Config,
    candidate: &ContextEntity,
    event_time: DateTime<Utc>,
) -> Result<Option<(ContextEntity, ResolvedBy)>, DbError> {
    for source_ref in &candidate.source_refs {
        if let Some(id) = memory.find_by_source_ref(candidate.entity_type, source_ref)? {
            if let Some(existing) = memory.get(&id)? {
                return Ok(Some((existing, ResolvedBy::SourceRef)));
            }
        }
    }

    let window = Duration::hours(config.resolution_window_hours.max(0));
    let filter = EntityFilter::of_type(candidate.entity_type)
        .since(event_time - window)
        .until(event_time + window);

    if let Some(vector) = candidate.embedding.as_deref() {
        let hits = memory.nearest(vector, NEIGHBOUR_K, &filter)?;
        if let Some(hit) = hits.into_iter().find(|h| {
            h.entity.entity_id != candidate.entity_id
                && (1.0 - h.distance) as f64 >= config.similarity_threshold
        }) {
            let similarity = 1.0 - hit.distance;
            return Ok(Some((hit.entity, ResolvedBy::Embedding(similarity))));
        }
    }

    let title = normalize_title(candidate.title());
    if title.is_empty() {
        return Ok(None);
    }
    let pool = memory.entities(&filter, Some(config.relationship_scan_limit))?;
    let best = pool
        .into_iter()
        .filter(|e| e.entity_id != candidate.entity_id)
        .filter(|e| candidate.embedding.is_none() || e.embedding.is_none())
        .map(|e| {
            let score = strsim::normalized_levenshtein(&title, &normalize_title(e.title()));
            (e, score)
        })
        .filter(|(_, score)| *score >= config.similarity_threshold)
        .max_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.updated_at.cmp(&b.0.updated_at))
        });

    Ok(best.map(|(e, score)| (e, ResolvedBy::Title(score))))
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fold `incoming` into `existing`.
///
/// Sets are unioned, importance takes the max, attributes are
/// last-writer-wins by event time, new text is appended to the summary.
pub fn merge(
    existing: &ContextEntity,
    incoming: &ContextEntity,
    event_time: DateTime<Utc>,
    max_summary_chars: usize,
) -> ContextEntity {
    let mut merged = existing.clone();

    merged.source_refs.extend(incoming.source_refs.iter().cloned());
    merged.importance = existing.importance.max(incoming.importance).clamp(0.0, 1.0);
    merged.created_at = existing.created_at.min(incoming.created_at);
    merged.updated_at = existing.updated_at.max(incoming.updated_at);

    let incoming_is_newer = event_time >= existing.updated_at;
    for (key, value) in &incoming.attributes {
        if incoming_is_newer || !merged.attributes.contains_key(key) {
            merged.attributes.insert(key.clone(), value.clone());
        }
    }

    merged.summary_text = append_summary(
        &existing.summary_text,
        &incoming.summary_text,
        max_summary_chars,
    );

    merged.embedding = match (&existing.embedding, &incoming.embedding) {
        (Some(old), Some(new)) => Some(mean_vector(old, new)),
        (None, Some(new)) => Some(new.clone()),
        (Some(old), None) => Some(old.clone()),
        (None, None) => None,
    };
    merged.embedding_pending = merged.embedding.is_none() || incoming.embedding_pending;
    merged.compacted = false;
    merged
}

fn append_summary(existing: &str, addition: &str, max_chars: usize) -> String {
    let addition = addition.trim();
    let combined = if addition.is_empty() || existing.contains(addition) {
        existing.to_string()
    } else if existing.trim().is_empty() {
        addition.to_string()
    } else {
        format!("{}\n{}", existing.trim_end(), addition)
    };
    combined.chars().take(max_chars).collect()
}
