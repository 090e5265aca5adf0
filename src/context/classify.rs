//! Pattern-based entity classification.
//!
//! Source-declared kind first, then source id conventions, then content
//! heuristics. Never rejects: anything unrecognized is `Other`.

use crate::entity::EntityType;
use crate::normalizer::NormalizedEvent;

/// Map a source-declared kind (`type` / `kind` / `category`).
fn from_kind_hint(hint: &str) -> Option<EntityType> {
    match hint {
        "meeting" | "event" | "calendar" | "calendar_event" => Some(EntityType::Meeting),
        "project" | "epic" => Some(EntityType::Project),
        "task" | "issue" | "todo" | "document" | "doc" | "ticket" => Some(EntityType::Task),
        "email" | "mail" | "message" | "chat" | "thread" => Some(EntityType::Communication),
        _ => None,
    }
}

/// Map a source id by naming convention.
fn from_source_id(source_id: &str) -> Option<EntityType> {
    let source = source_id.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| source.contains(n));
    if has(&["calendar"]) {
        Some(EntityType::Meeting)
    } else if has(&["mail", "gmail", "slack", "chat"]) {
        Some(EntityType::Communication)
    } else if has(&["linear", "jira", "asana", "github"]) {
        Some(EntityType::Task)
    } else {
        None
    }
}

fn from_content(event: &NormalizedEvent) -> Option<EntityType> {
    if event.attributes.contains_key("start_time") && event.attributes.contains_key("end_time") {
        return Some(EntityType::Meeting);
    }
    let title = event.title.to_lowercase();
    if title.starts_with("project ") || title.ends_with(" project") {
        return Some(EntityType::Project);
    }
    let text = format!("{} {}", title, event.body.to_lowercase());
    if ["todo", "to-do", "action item", "task"]
        .iter()
        .any(|marker| text.contains(marker))
    {
        return Some(EntityType::Task);
    }
    if event.attributes.contains_key("sender")
        || event.attributes.contains_key("from")
        || !event.participants.is_empty()
    {
        return Some(EntityType::Communication);
    }
    None
}

pub fn classify(event: &NormalizedEvent) -> EntityType {
    event
        .kind_hint
        .as_deref()
        .and_then(from_kind_hint)
        .or_else(|| from_source_id(&event.source_id))
        .or_else(|| from_content(event))
        .unwrap_or(EntityType::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{parse_payload, RawEvent};
    use chrono::Utc;
    use serde_json::json;

    fn event(source: &str, payload: serde_json::Value) -> NormalizedEvent {
        parse_payload(&RawEvent::new(source, "x", Utc::now(), payload, "1")).expect("valid")
    }

    #[test]
    fn test_kind_hint_wins() {
        let e = event("calendar", json!({"type": "document", "title": "Deck"}));
        assert_eq!(classify(&e), EntityType::Task);
    }

    #[test]
    fn test_source_id_convention() {
        assert_eq!(
            classify(&event("gmail", json!({"subject": "Lunch?"}))),
            EntityType::Communication
        );
        assert_eq!(
            classify(&event("linear", json!({"title": "Fix login"}))),
            EntityType::Task
        );
    }

    #[test]
    fn test_content_fallbacks() {
        let meeting = event(
            "misc",
            json!({"title": "Sync", "start_time": "2026-10-19T10:00:00Z", "end_time": "2026-10-19T11:00:00Z"}),
        );
        assert_eq!(classify(&meeting), EntityType::Meeting);
        assert_eq!(
            classify(&event("misc", json!({"title": "Project Phoenix"}))),
            EntityType::Project
        );
        assert_eq!(
            classify(&event("misc", json!({"title": "Random note"}))),
            EntityType::Other
        );
    }
}
