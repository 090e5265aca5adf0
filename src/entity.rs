//! Context entities and the relationship graph between them.
//!
//! A `ContextEntity` is the distilled, time-aware record of one logical
//! subject (a meeting, project, task or communication) observed through one
//! or more raw events. Once persisted it is owned by the vector memory; the
//! context engine only constructs and merges candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of subject an entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Meeting,
    Project,
    Task,
    Communication,
    Other,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Meeting,
        EntityType::Project,
        EntityType::Task,
        EntityType::Communication,
        EntityType::Other,
    ];

    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Meeting => "meeting",
            EntityType::Project => "project",
            EntityType::Task => "task",
            EntityType::Communication => "communication",
            EntityType::Other => "other",
        }
    }

    /// Parse from SQL string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "meeting" => Some(EntityType::Meeting),
            "project" => Some(EntityType::Project),
            "task" => Some(EntityType::Task),
            "communication" => Some(EntityType::Communication),
            "other" => Some(EntityType::Other),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar attribute value. Payload objects and arrays are never stored as
/// attributes; they are flattened into the normalized event fields instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// Convert a JSON scalar. Returns None for null, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(AttrValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(AttrValue::Int)
                .or_else(|| n.as_f64().map(AttrValue::Float)),
            serde_json::Value::String(s) => Some(AttrValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Int(i) => Some(*i != 0),
            AttrValue::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            AttrValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            AttrValue::Text(s) => s.trim().parse().ok(),
            AttrValue::Bool(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a text attribute as an RFC3339 timestamp.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.as_text()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// A structured record distilled from one or more raw events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `source_id:external_id` of every raw event folded into this entity.
    pub source_refs: BTreeSet<String>,
    pub importance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub summary_text: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Persisted without a vector; picked up by the embedding backfill.
    #[serde(default)]
    pub embedding_pending: bool,
    /// Rewritten as a reduced summary by compaction.
    #[serde(default)]
    pub compacted: bool,
}

impl ContextEntity {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        self.attr(key).and_then(AttrValue::as_bool).unwrap_or(false)
    }

    pub fn attr_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.attr(key).and_then(AttrValue::as_datetime)
    }

    /// Display title: the `title` attribute, else the first summary line.
    pub fn title(&self) -> &str {
        self.attr("title")
            .and_then(AttrValue::as_text)
            .unwrap_or_else(|| self.summary_text.lines().next().unwrap_or(""))
    }

    /// Lowercased participant handles, stored as a comma-joined attribute.
    pub fn participants(&self) -> BTreeSet<String> {
        self.attr("participants")
            .and_then(AttrValue::as_text)
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Directed relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Mentions,
    Blocks,
    PartOf,
    Follows,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Mentions => "mentions",
            RelationshipKind::Blocks => "blocks",
            RelationshipKind::PartOf => "part_of",
            RelationshipKind::Follows => "follows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mentions" => Some(RelationshipKind::Mentions),
            "blocks" => Some(RelationshipKind::Blocks),
            "part_of" => Some(RelationshipKind::PartOf),
            "follows" => Some(RelationshipKind::Follows),
            _ => None,
        }
    }

    /// Mentions read the same in both directions; the others are ordered.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, RelationshipKind::Mentions)
    }
}

/// An edge in the relationship graph, unique by `(from_id, to_id, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub kind: RelationshipKind,
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        from_id: &str,
        to_id: &str,
        kind: RelationshipKind,
        confidence: f64,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            discovered_at,
        }
    }

    pub fn touches(&self, entity_id: &str) -> bool {
        self.from_id == entity_id || self.to_id == entity_id
    }

    /// The endpoint that is not `entity_id`.
    pub fn other(&self, entity_id: &str) -> &str {
        if self.from_id == entity_id {
            &self.to_id
        } else {
            &self.from_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip_labels() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::parse("account"), None);
    }

    #[test]
    fn test_attr_value_from_json() {
        assert_eq!(
            AttrValue::from_json(&serde_json::json!(true)),
            Some(AttrValue::Bool(true))
        );
        assert_eq!(AttrValue::from_json(&serde_json::json!(3)), Some(AttrValue::Int(3)));
        assert_eq!(
            AttrValue::from_json(&serde_json::json!(0.5)),
            Some(AttrValue::Float(0.5))
        );
        assert_eq!(AttrValue::from_json(&serde_json::json!([1, 2])), None);
        assert_eq!(AttrValue::from_json(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_attr_value_coercions() {
        assert_eq!(AttrValue::Text("yes".to_string()).as_bool(), Some(true));
        assert_eq!(AttrValue::Text("0.25".to_string()).as_f64(), Some(0.25));
        assert!(AttrValue::Text("2026-10-19T10:00:00Z".to_string())
            .as_datetime()
            .is_some());
    }

    #[test]
    fn test_relationship_confidence_clamped() {
        let now = Utc::now();
        let rel = Relationship::new("a", "b", RelationshipKind::Blocks, 1.7, now);
        assert_eq!(rel.confidence, 1.0);
        assert_eq!(rel.other("a"), "b");
        assert_eq!(rel.other("b"), "a");
        assert!(!RelationshipKind::PartOf.is_symmetric());
    }
}
