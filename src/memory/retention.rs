//! Retention: pruning, compaction and embedding backfill.
//!
//! All three are scheduled maintenance, never triggered from ingestion.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::VectorMemory;
use crate::db::DbError;
use crate::embeddings::{embed_with_timeout, Embedder};
use crate::entity::{Attributes, ContextEntity};

const COMPACT_SUMMARY_CHARS: usize = 280;
const COMPACT_KEEP_ATTRIBUTES: &[&str] = &["title", "start_time", "end_time"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub entities_removed: usize,
    pub relationships_removed: usize,
    pub ledger_rows_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactReport {
    pub compacted: usize,
    /// Rewritten without a vector; left for backfill.
    pub pending_embedding: usize,
    /// Changed by ingestion while being compacted; retried next run.
    pub skipped: usize,
}

/// First sentence of `text`, bounded to `max_chars` characters.
pub fn first_sentence(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|&(i, c)| {
            matches!(c, '.' | '!' | '?')
                && trimmed[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or_else(|| trimmed.find('\n').unwrap_or(trimmed.len()));
    trimmed[..end].trim().chars().take(max_chars).collect()
}

/// The reduced form kept for a compacted entity.
pub fn compact_entity(entity: &ContextEntity) -> ContextEntity {
    let mut compacted = entity.clone();
    let title = entity.title().to_string();
    let mut summary = first_sentence(&entity.summary_text, COMPACT_SUMMARY_CHARS);
    if summary.is_empty() {
        summary = title.chars().take(COMPACT_SUMMARY_CHARS).collect();
    }
    compacted.summary_text = summary;
    compacted.attributes = entity
        .attributes
        .iter()
        .filter(|(k, _)| COMPACT_KEEP_ATTRIBUTES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Attributes>();
    compacted.compacted = true;
    compacted
}

impl VectorMemory {
    /// Delete entities past the retention horizon whose importance is below
    /// the floor, with their edges. Nothing else is touched.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport, DbError> {
        let cutoff = now - self.config.retention();
        let floor = self.config.low_importance_floor;
        let report = self.with_writer(|db| {
            db.with_transaction(|tx| {
                let ids = tx.prune_candidates(&cutoff, floor)?;
                let (entities_removed, relationships_removed) = tx.delete_entities(&ids)?;
                let ledger_rows_removed = tx.prune_processed(&cutoff)?;
                Ok(PruneReport {
                    entities_removed,
                    relationships_removed,
                    ledger_rows_removed,
                })
            })
        })?;
        if report.entities_removed > 0 {
            log::info!(
                "Memory: pruned {} entities, {} relationships",
                report.entities_removed,
                report.relationships_removed
            );
        }
        Ok(report)
    }

    /// Rewrite mid-importance entities past the horizon as reduced summaries.
    /// Ids and edges are preserved.
    pub async fn compact(
        &self,
        now: DateTime<Utc>,
        embedder: &Arc<dyn Embedder>,
    ) -> Result<CompactReport, DbError> {
        let cutoff = now - self.config.retention();
        let candidates = self.with_reader(|db| {
            db.compaction_candidates(
                &cutoff,
                self.config.low_importance_floor,
                self.config.summary_band_ceiling,
            )
        })?;

        let mut report = CompactReport::default();
        for original in candidates {
            let mut reduced = compact_entity(&original);
            match embed_with_timeout(
                embedder,
                &reduced.summary_text,
                self.config.embedding_timeout_secs,
            )
            .await
            {
                Ok(vector) => {
                    reduced.embedding = Some(vector);
                    reduced.embedding_pending = false;
                }
                Err(e) => {
                    log::warn!("Memory: re-embed of {} failed: {}", original.entity_id, e);
                    reduced.embedding = None;
                    reduced.embedding_pending = true;
                }
            }

            let written = self.with_writer(|db| {
                db.with_transaction(|tx| match tx.get_entity(&original.entity_id)? {
                    Some(current) if current.updated_at == original.updated_at => {
                        tx.write_entity(&reduced)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                })
            })?;
            if written {
                report.compacted += 1;
                if reduced.embedding_pending {
                    report.pending_embedding += 1;
                }
            } else {
                report.skipped += 1;
            }
        }
        if report.compacted > 0 {
            log::info!("Memory: compacted {} entities", report.compacted);
        }
        Ok(report)
    }

    /// Embed entities persisted without a vector. Returns how many were filled.
    pub async fn backfill_embeddings(
        &self,
        embedder: &Arc<dyn Embedder>,
        limit: usize,
    ) -> Result<usize, DbError> {
        let pending = self.with_reader(|db| db.pending_embeddings(limit))?;
        let mut filled = 0;
        for entity in pending {
            let text = format!("{}\n{}", entity.title(), entity.summary_text);
            match embed_with_timeout(embedder, &text, self.config.embedding_timeout_secs).await {
                Ok(vector) => {
                    if self.with_writer(|db| {
                        db.set_embedding(&entity.entity_id, &vector, &entity.updated_at)
                    })? {
                        filled += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Memory: backfill stopped, embedder unavailable: {}", e);
                    break;
                }
            }
        }
        if filled > 0 {
            log::info!("Memory: backfilled {} embeddings", filled);
        }
        Ok(filled)
    }
}
