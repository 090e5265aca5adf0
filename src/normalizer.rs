//! Event normalization: validate, dedup and flatten raw source events.
//!
//! A raw event is accepted once per `(source_id, external_id)`. The ledger
//! entry and the cursor advance are written only after the event's entity
//! has been persisted, so a crash mid-batch replays events instead of
//! dropping them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{DbError, MemoryDb};
use crate::entity::{AttrValue, Attributes, RelationshipKind};

/// An event as delivered by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub source_id: String,
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub cursor: String,
}

impl RawEvent {
    pub fn new(
        source_id: &str,
        external_id: &str,
        timestamp: DateTime<Utc>,
        payload: Value,
        cursor: &str,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            external_id: external_id.to_string(),
            timestamp,
            payload,
            cursor: cursor.to_string(),
        }
    }
}

/// An explicit pointer from one event to another record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventReference {
    pub kind: RelationshipKind,
    pub source_id: String,
    pub external_id: String,
}

impl EventReference {
    pub fn source_ref(&self) -> String {
        format!("{}:{}", self.source_id, self.external_id)
    }
}

/// A validated event with its payload flattened into known fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub source_id: String,
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
    pub cursor: String,
    pub kind_hint: Option<String>,
    pub title: String,
    pub body: String,
    pub participants: Vec<String>,
    pub references: Vec<EventReference>,
    pub attributes: Attributes,
}

impl NormalizedEvent {
    pub fn source_ref(&self) -> String {
        format!("{}:{}", self.source_id, self.external_id)
    }

    /// Title and body joined for embedding and keyword matching.
    pub fn text(&self) -> String {
        match (self.title.is_empty(), self.body.is_empty()) {
            (false, false) => format!("{}\n{}", self.title, self.body),
            (false, true) => self.title.clone(),
            _ => self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Normalized(NormalizedEvent),
    Duplicate,
    Malformed(String),
}

const KIND_FIELDS: &[&str] = &["type", "kind", "category"];
const TITLE_FIELDS: &[&str] = &["title", "subject", "summary", "name"];
const BODY_FIELDS: &[&str] = &["body", "text", "description", "snippet"];
const PARTICIPANT_FIELDS: &[&str] = &[
    "participants",
    "attendees",
    "from",
    "to",
    "cc",
    "assignee",
    "sender",
];
const REFERENCE_FIELDS: &[(&str, RelationshipKind)] = &[
    ("references", RelationshipKind::Mentions),
    ("mentions", RelationshipKind::Mentions),
    ("blocks", RelationshipKind::Blocks),
    ("part_of", RelationshipKind::PartOf),
    ("parent", RelationshipKind::PartOf),
    ("project", RelationshipKind::PartOf),
    ("in_reply_to", RelationshipKind::Follows),
    ("follows", RelationshipKind::Follows),
];
const TIME_FIELDS: &[(&str, &[&str])] = &[
    ("start_time", &["start_time", "startTime", "start"]),
    ("end_time", &["end_time", "endTime", "end"]),
];

/// Validate and dedup one raw event against the processed-event ledger.
pub fn normalize(db: &MemoryDb, raw: &RawEvent) -> Result<NormalizeOutcome, DbError> {
    if raw.source_id.trim().is_empty() || raw.external_id.trim().is_empty() {
        return Ok(NormalizeOutcome::Malformed(
            "missing source_id or external_id".to_string(),
        ));
    }
    if db.is_processed(&raw.source_id, &raw.external_id)? {
        return Ok(NormalizeOutcome::Duplicate);
    }
    Ok(match parse_payload(raw) {
        Ok(event) => NormalizeOutcome::Normalized(event),
        Err(reason) => NormalizeOutcome::Malformed(reason),
    })
}

/// Record the event as handled and move the source cursor forward.
pub fn commit(
    db: &MemoryDb,
    event: &NormalizedEvent,
    entity_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    db.with_transaction(|tx| {
        tx.mark_processed(
            &event.source_id,
            &event.external_id,
            &event.cursor,
            entity_id,
            &now,
        )?;
        if !event.cursor.is_empty() {
            tx.advance_cursor(&event.source_id, &event.cursor)?;
        }
        Ok(())
    })
}

/// Record a malformed event so replays do not report it again.
pub fn commit_rejected(db: &MemoryDb, raw: &RawEvent, now: DateTime<Utc>) -> Result<(), DbError> {
    if raw.source_id.trim().is_empty() || raw.external_id.trim().is_empty() {
        return Ok(());
    }
    db.mark_processed(&raw.source_id, &raw.external_id, &raw.cursor, None, &now)?;
    Ok(())
}

/// Apply a connector's page cursor once every event in the page is committed.
pub fn advance_cursor(db: &MemoryDb, source_id: &str, next_cursor: &str) -> Result<bool, DbError> {
    if next_cursor.is_empty() {
        return Ok(false);
    }
    db.advance_cursor(source_id, next_cursor)
}

/// Flatten a payload. Errors name the reason the event is malformed.
pub fn parse_payload(raw: &RawEvent) -> Result<NormalizedEvent, String> {
    let obj = raw
        .payload
        .as_object()
        .ok_or_else(|| "payload is not a JSON object".to_string())?;

    let title = first_text(obj, TITLE_FIELDS).unwrap_or_default();
    let body = first_text(obj, BODY_FIELDS).unwrap_or_default();
    if title.is_empty() && body.is_empty() {
        return Err("payload has no text fields".to_string());
    }

    let kind_hint = first_text(obj, KIND_FIELDS).map(|k| k.to_lowercase());

    let mut participants = BTreeSet::new();
    for field in PARTICIPANT_FIELDS {
        if let Some(value) = obj.get(*field) {
            collect_participants(value, &mut participants);
        }
    }

    let mut references = BTreeSet::new();
    for (field, kind) in REFERENCE_FIELDS {
        if let Some(value) = obj.get(*field) {
            for target in string_list(value) {
                let (source_id, external_id) = match target.split_once(':') {
                    Some((s, e)) if !s.is_empty() && !e.is_empty() => (s.to_string(), e.to_string()),
                    _ => (raw.source_id.clone(), target.clone()),
                };
                references.insert(EventReference {
                    kind: *kind,
                    source_id,
                    external_id,
                });
            }
        }
    }

    let mut attributes: Attributes = BTreeMap::new();
    for (key, value) in obj {
        if let Some(attr) = AttrValue::from_json(value) {
            attributes.insert(key.clone(), attr);
        }
    }
    for (target, candidates) in TIME_FIELDS {
        for field in *candidates {
            attributes.remove(*field);
        }
        if let Some(time) = candidates.iter().find_map(|f| obj.get(*f).and_then(parse_time)) {
            attributes.insert(
                target.to_string(),
                AttrValue::Text(crate::db::ts(&time)),
            );
        }
    }
    if !title.is_empty() {
        attributes.insert("title".to_string(), AttrValue::Text(title.clone()));
    }
    if !participants.is_empty() {
        let joined = participants.iter().cloned().collect::<Vec<_>>().join(",");
        attributes.insert("participants".to_string(), AttrValue::Text(joined));
    }

    Ok(NormalizedEvent {
        source_id: raw.source_id.clone(),
        external_id: raw.external_id.clone(),
        timestamp: raw.timestamp,
        cursor: raw.cursor.clone(),
        kind_hint,
        title,
        body,
        participants: participants.into_iter().collect(),
        references: references.into_iter().collect(),
        attributes,
    })
}

fn first_text(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| {
        obj.get(*f)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// A string, a comma-separated string, or an array of strings.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items.iter().flat_map(string_list).collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

/// Participants may be plain handles or calendar-style `{email, name}` objects.
fn collect_participants(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(o) => {
            if let Some(handle) = o
                .get("email")
                .or_else(|| o.get("name"))
                .and_then(Value::as_str)
            {
                let handle = handle.trim().to_lowercase();
                if !handle.is_empty() {
                    out.insert(handle);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_participants(item, out);
            }
        }
        other => {
            for handle in string_list(other) {
                out.insert(handle.to_lowercase());
            }
        }
    }
}

/// RFC3339 text or a calendar `{dateTime}` / `{date}` object.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(o) => o
            .get("dateTime")
            .or_else(|| o.get("date_time"))
            .and_then(parse_time)
            .or_else(|| {
                o.get("date")
                    .and_then(Value::as_str)
                    .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}
