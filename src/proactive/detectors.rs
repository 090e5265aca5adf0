//! Built-in detectors.
//!
//! Each detector is a pure function over the touched entities plus read-only
//! memory lookups, returning zero or more candidates. Store errors are
//! reported as `Err` so the generator can log and skip them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use super::engine::{AlertPriority, CandidateAlert, DetectorInput};
use crate::db::EntityFilter;
use crate::entity::{ContextEntity, EntityType};

pub const UNSAVED_DOCUMENT: &str = "unsaved-document-before-meeting";
pub const UNTRACKED_PROJECT: &str = "untracked-project";
pub const SCHEDULE_CONFLICT: &str = "schedule-conflict";
pub const COMMUNICATION_LOAD: &str = "communication-load";
pub const MEETING_FOLLOW_UP: &str = "meeting-follow-up";
pub const MEETING_REMINDER: &str = "meeting-reminder";

/// How far back meetings are scanned for conflicts and follow-ups.
const MEETING_SCAN_DAYS: i64 = 30;

fn store_err(e: crate::db::DbError) -> String {
    e.to_string()
}

fn meeting_window(entity: &ContextEntity) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = entity.attr_time("start_time")?;
    let end = entity.attr_time("end_time").unwrap_or(start);
    Some((start, end.max(start)))
}

fn is_cancelled(entity: &ContextEntity) -> bool {
    entity
        .attr("status")
        .and_then(|v| v.as_text())
        .map(|s| s.eq_ignore_ascii_case("cancelled") || s.eq_ignore_ascii_case("canceled"))
        .unwrap_or(false)
}

fn recent_meetings(input: &DetectorInput<'_>) -> Result<Vec<ContextEntity>, String> {
    input
        .memory
        .entities(
            &EntityFilter::of_type(EntityType::Meeting)
                .since(input.now - Duration::days(MEETING_SCAN_DAYS)),
            Some(input.config.relationship_scan_limit),
        )
        .map_err(store_err)
}

/// Entities linked to `entity_id` by any edge.
fn neighbours(
    input: &DetectorInput<'_>,
    entity_id: &str,
) -> Result<Vec<ContextEntity>, String> {
    let edges = input.memory.related(entity_id).map_err(store_err)?;
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for edge in edges {
        let other = edge.other(entity_id).to_string();
        if seen.insert(other.clone()) {
            if let Some(entity) = input.memory.get(&other).map_err(store_err)? {
                out.push(entity);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Detector 1: Unsaved document before meeting
// ---------------------------------------------------------------------------

/// Meeting starting soon with a related task flagged unsaved and left
/// untouched for a while.
pub fn detect_unsaved_document_before_meeting(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let cfg = &input.config.detectors;
    let lookahead = Duration::minutes(cfg.meeting_lookahead_minutes);
    let stale = Duration::minutes(cfg.unsaved_stale_minutes);

    // Meetings either touched directly or reached from a touched task.
    let mut meetings: BTreeMap<String, ContextEntity> = BTreeMap::new();
    for entity in input.entities {
        match entity.entity_type {
            EntityType::Meeting => {
                meetings.insert(entity.entity_id.clone(), entity.clone());
            }
            EntityType::Task => {
                for other in neighbours(input, &entity.entity_id)? {
                    if other.entity_type == EntityType::Meeting {
                        meetings.insert(other.entity_id.clone(), other);
                    }
                }
            }
            _ => {}
        }
    }

    let mut candidates = Vec::new();
    for meeting in meetings.values() {
        if is_cancelled(meeting) {
            continue;
        }
        let Some((start, _)) = meeting_window(meeting) else {
            continue;
        };
        if start <= input.now || start - input.now > lookahead {
            continue;
        }

        let unsaved: Vec<ContextEntity> = neighbours(input, &meeting.entity_id)?
            .into_iter()
            .filter(|e| e.entity_type == EntityType::Task)
            .filter(|e| e.attr_bool("unsaved"))
            .filter(|e| input.now - e.updated_at >= stale)
            .collect();
        if unsaved.is_empty() {
            continue;
        }

        let minutes = (start - input.now).num_minutes();
        let names: Vec<&str> = unsaved.iter().map(|e| e.title()).collect();
        let mut candidate = CandidateAlert::new(UNSAVED_DOCUMENT, UNSAVED_DOCUMENT, input.now);
        candidate.evidence.insert(meeting.entity_id.clone());
        candidate
            .evidence
            .extend(unsaved.iter().map(|e| e.entity_id.clone()));
        candidate.raw_confidence = 0.9;
        candidate.priority = AlertPriority::High;
        candidate.urgent = minutes <= 10;
        candidate.subject = Some(meeting.entity_id.clone());
        candidate.title = format!("Unsaved work before {}", meeting.title());
        candidate.message = format!(
            "{} starts in {} minutes and {} still has unsaved changes.",
            meeting.title(),
            minutes,
            names.join(", ")
        );
        candidate.suggested_actions = vec![
            format!("Save {}", names.join(", ")),
            "Share the latest version with attendees".to_string(),
        ];
        candidates.push(candidate);
    }

    Ok(candidates)
}

// ---------------------------------------------------------------------------
// Detector 2: Untracked project
// ---------------------------------------------------------------------------

fn project_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[Pp]roject\s+([A-Z][\p{L}\p{N}_-]*)").expect("valid project regex")
    })
}

/// Normalized subject key for a project name.
pub fn project_key(name: &str) -> String {
    name.nfkc().collect::<String>().trim().to_lowercase()
}

/// Project names mentioned in an entity's title or summary.
pub fn project_mentions(entity: &ContextEntity) -> BTreeMap<String, String> {
    let text = format!("{}\n{}", entity.title(), entity.summary_text);
    project_pattern()
        .captures_iter(&text)
        .filter_map(|c| c.get(1))
        .map(|m| (project_key(m.as_str()), m.as_str().to_string()))
        .collect()
}

/// Repeated mentions of a named project in communications with no project
/// entity tracking it. One candidate per name.
pub fn detect_untracked_project(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let cfg = &input.config.detectors;

    let mut names: BTreeMap<String, String> = BTreeMap::new();
    for entity in input.entities {
        if entity.entity_type == EntityType::Communication {
            names.extend(project_mentions(entity));
        }
    }
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let window = Duration::days(cfg.project_mention_window_days);
    let communications = input
        .memory
        .entities(
            &EntityFilter::of_type(EntityType::Communication).since(input.now - window),
            None,
        )
        .map_err(store_err)?;
    let projects = input
        .memory
        .entities(&EntityFilter::of_type(EntityType::Project), None)
        .map_err(store_err)?;
    let tracked: BTreeSet<String> = projects
        .iter()
        .flat_map(|p| {
            let title = project_key(p.title());
            let bare = title
                .strip_prefix("project ")
                .map(str::to_string)
                .unwrap_or_else(|| title.clone());
            [title, bare]
        })
        .collect();

    let mut candidates = Vec::new();
    for (key, display) in names {
        if tracked.contains(&key) {
            continue;
        }
        let evidence: BTreeSet<String> = communications
            .iter()
            .filter(|c| project_mentions(c).contains_key(&key))
            .map(|c| c.entity_id.clone())
            .collect();
        if evidence.len() < cfg.project_mention_threshold {
            continue;
        }

        let extra = (evidence.len() - cfg.project_mention_threshold) as f64;
        let mut candidate = CandidateAlert::new(UNTRACKED_PROJECT, UNTRACKED_PROJECT, input.now);
        candidate.raw_confidence = (0.75 + 0.05 * extra).min(0.95);
        candidate.priority = AlertPriority::Medium;
        candidate.subject = Some(key.clone());
        candidate.title = format!("Project {} is not tracked", display);
        candidate.message = format!(
            "Project {} came up in {} conversations this week but has no project record.",
            display,
            evidence.len()
        );
        candidate.suggested_actions = vec![
            format!("Create a project for {}", display),
            "Link the related conversations".to_string(),
        ];
        candidate.evidence = evidence;
        candidates.push(candidate);
    }

    Ok(candidates)
}

// ---------------------------------------------------------------------------
// Detector 3: Schedule conflict
// ---------------------------------------------------------------------------

/// Two upcoming meetings with overlapping `[start, end)` windows.
pub fn detect_schedule_conflict(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let touched: Vec<&ContextEntity> = input
        .entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Meeting && !is_cancelled(e))
        .collect();
    if touched.is_empty() {
        return Ok(Vec::new());
    }
    let others = recent_meetings(input)?;

    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();
    for meeting in touched {
        let Some((start, end)) = meeting_window(meeting) else {
            continue;
        };
        if end <= input.now || start == end {
            continue;
        }
        for other in &others {
            if other.entity_id == meeting.entity_id || is_cancelled(other) {
                continue;
            }
            let Some((o_start, o_end)) = meeting_window(other) else {
                continue;
            };
            if !(start < o_end && o_start < end) {
                continue;
            }
            let pair: BTreeSet<String> = [meeting.entity_id.clone(), other.entity_id.clone()]
                .into_iter()
                .collect();
            let subject = pair.iter().cloned().collect::<Vec<_>>().join("+");
            if !seen.insert(subject.clone()) {
                continue;
            }

            let first_start = start.min(o_start);
            let mut candidate =
                CandidateAlert::new(SCHEDULE_CONFLICT, SCHEDULE_CONFLICT, input.now);
            candidate.evidence = pair;
            candidate.raw_confidence = 0.9;
            candidate.priority = AlertPriority::High;
            candidate.urgent = first_start > input.now && first_start - input.now <= Duration::minutes(30);
            candidate.subject = Some(subject);
            candidate.title = "Schedule conflict".to_string();
            candidate.message = format!(
                "{} overlaps with {} ({}).",
                meeting.title(),
                other.title(),
                o_start.format("%a %H:%M")
            );
            candidate.suggested_actions = vec![
                format!("Reschedule {}", other.title()),
                format!("Decline {}", meeting.title()),
            ];
            candidates.push(candidate);
        }
    }

    Ok(candidates)
}

// ---------------------------------------------------------------------------
// Detector 4: Communication load
// ---------------------------------------------------------------------------

/// Sustained high message volume: at least the daily threshold on each of
/// the last N days (today included).
pub fn detect_communication_load(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let cfg = &input.config.detectors;
    if cfg.communication_load_days <= 0
        || !input
            .entities
            .iter()
            .any(|e| e.entity_type == EntityType::Communication)
    {
        return Ok(Vec::new());
    }

    let today = input.now.date_naive();
    let first_day = today - Duration::days(cfg.communication_load_days - 1);
    let since = first_day
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(input.now);
    let communications = input
        .memory
        .entities(&EntityFilter::of_type(EntityType::Communication).since(since), None)
        .map_err(store_err)?;

    let mut per_day: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    for c in &communications {
        let day = c.created_at.date_naive();
        if day >= first_day && day <= today {
            per_day.entry(day).or_default().push(c.entity_id.clone());
        }
    }

    let days: Vec<NaiveDate> = (0..cfg.communication_load_days)
        .map(|offset| first_day + Duration::days(offset))
        .collect();
    let overloaded = days.iter().all(|d| {
        per_day
            .get(d)
            .map(|ids| ids.len() >= cfg.communication_load_daily)
            .unwrap_or(false)
    });
    if !overloaded {
        return Ok(Vec::new());
    }

    let total: usize = days.iter().filter_map(|d| per_day.get(d)).map(Vec::len).sum();
    let mut candidate = CandidateAlert::new(COMMUNICATION_LOAD, COMMUNICATION_LOAD, input.now);
    candidate.evidence = per_day
        .get(&today)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default();
    candidate.raw_confidence = 0.7;
    candidate.priority = AlertPriority::Medium;
    candidate.subject = Some(today.to_string());
    candidate.title = "Heavy communication load".to_string();
    candidate.message = format!(
        "{} messages over the last {} days, at least {} every day.",
        total, cfg.communication_load_days, cfg.communication_load_daily
    );
    candidate.suggested_actions = vec![
        "Block focus time".to_string(),
        "Batch replies into two sessions".to_string(),
    ];
    Ok(vec![candidate])
}

// ---------------------------------------------------------------------------
// Detector 5: Meeting follow-up
// ---------------------------------------------------------------------------

/// Meeting that ended recently with no related communication since.
pub fn detect_meeting_follow_up(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let window = Duration::hours(input.config.detectors.follow_up_window_hours);
    let mut candidates = Vec::new();

    for meeting in recent_meetings(input)? {
        if is_cancelled(&meeting) {
            continue;
        }
        let Some((_, end)) = meeting_window(&meeting) else {
            continue;
        };
        if end > input.now || input.now - end > window {
            continue;
        }
        let followed_up = neighbours(input, &meeting.entity_id)?
            .iter()
            .any(|e| e.entity_type == EntityType::Communication && e.updated_at > end);
        if followed_up {
            continue;
        }

        let mut candidate = CandidateAlert::new(MEETING_FOLLOW_UP, MEETING_FOLLOW_UP, input.now);
        candidate.evidence.insert(meeting.entity_id.clone());
        candidate.raw_confidence = 0.7;
        candidate.priority = AlertPriority::Low;
        candidate.subject = Some(meeting.entity_id.clone());
        candidate.title = format!("Follow up on {}", meeting.title());
        candidate.message = format!(
            "{} ended {} hours ago and nothing has been sent since.",
            meeting.title(),
            (input.now - end).num_hours()
        );
        candidate.suggested_actions = vec![
            "Send a recap to attendees".to_string(),
            "Capture action items".to_string(),
        ];
        candidates.push(candidate);
    }

    Ok(candidates)
}

// ---------------------------------------------------------------------------
// Detector 6: Meeting reminder
// ---------------------------------------------------------------------------

/// Plain heads-up for a touched meeting that starts within the lookahead.
pub fn detect_meeting_reminder(
    input: &DetectorInput<'_>,
) -> Result<Vec<CandidateAlert>, String> {
    let lookahead = Duration::minutes(input.config.detectors.meeting_lookahead_minutes);
    let mut candidates = Vec::new();

    for meeting in input.entities {
        if meeting.entity_type != EntityType::Meeting || is_cancelled(meeting) {
            continue;
        }
        let Some((start, _)) = meeting_window(meeting) else {
            continue;
        };
        if start <= input.now || start - input.now > lookahead {
            continue;
        }

        let minutes = (start - input.now).num_minutes();
        let mut candidate = CandidateAlert::new(MEETING_REMINDER, MEETING_REMINDER, input.now);
        candidate.evidence.insert(meeting.entity_id.clone());
        candidate.raw_confidence = 0.6;
        candidate.priority = AlertPriority::Medium;
        candidate.subject = Some(meeting.entity_id.clone());
        candidate.title = format!("Upcoming: {}", meeting.title());
        candidate.message = format!("{} starts in {} minutes.", meeting.title(), minutes);
        candidate.suggested_actions = vec![
            "Review the agenda".to_string(),
            "Prepare documents".to_string(),
            "Join the meeting room".to_string(),
        ];
        candidates.push(candidate);
    }

    Ok(candidates)
}
