//! Walk one scripted morning through the pipeline against a throwaway
//! database and print the resulting alerts.
//!
//! Usage: `cargo run --bin foresight-demo`

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use foresight_lib::connectors::{PollResult, StaticConnector};
use foresight_lib::delivery::LogDelivery;
use foresight_lib::embeddings::HashEmbedder;
use foresight_lib::normalizer::RawEvent;
use foresight_lib::state::AppState;
use foresight_lib::triage::{AlertState, FeedbackAction};
use foresight_lib::types::Config;

const THREADS: [(&str, &str); 3] = [
    (
        "Project Phoenix kickoff",
        "Agenda attached for Thursday. Please confirm attendance by Wednesday.",
    ),
    (
        "Re: Project Phoenix budget",
        "Finance approved the first tranche; procurement needs signed quotes.",
    ),
    (
        "Project Phoenix vendor shortlist",
        "Three vendors remain after demos, pricing sheets and customer calls.",
    ),
];

fn mail(i: i64, now: DateTime<Utc>) -> RawEvent {
    let (subject, body) = THREADS[(i as usize - 1) % THREADS.len()];
    RawEvent::new(
        "mail",
        &format!("msg-{}", i),
        now - Duration::hours(i),
        json!({
            "type": "email",
            "subject": subject,
            "body": body,
            "from": format!("sender{}@example.com", i),
        }),
        &i.to_string(),
    )
}

fn meeting(id: &str, title: &str, start: DateTime<Utc>, minutes: i64, now: DateTime<Utc>) -> RawEvent {
    RawEvent::new(
        "calendar",
        id,
        now,
        json!({
            "type": "meeting",
            "title": title,
            "start": start.to_rfc3339(),
            "end": (start + Duration::minutes(minutes)).to_rfc3339(),
        }),
        id,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let db = std::env::temp_dir().join(format!("foresight-demo-{}.db", uuid::Uuid::new_v4()));
    let config = Config {
        db_path: Some(db.to_string_lossy().to_string()),
        ..Config::default()
    };
    let state = AppState::with_capabilities(
        config,
        Arc::new(HashEmbedder::default()),
        Arc::new(LogDelivery),
    )?;
    let pipeline = &state.pipeline;

    // Monday 10:00 UTC, inside default working hours.
    let now = Utc
        .with_ymd_and_hms(2026, 10, 19, 10, 0, 0)
        .single()
        .ok_or("bad demo clock")?;

    let calendar = StaticConnector::new("calendar", Vec::new());
    calendar.push(meeting("evt-1", "Quarterly budget review", now + Duration::hours(1), 60, now));
    calendar.push(meeting("evt-2", "Hiring loop debrief", now + Duration::minutes(90), 45, now));
    let report = pipeline.poll_once(&calendar, now).await?;
    println!("calendar: {:?}", report);

    let page = PollResult {
        events: (1..=3).map(|i| mail(i, now)).collect(),
        next_cursor: Some("3".to_string()),
    };
    let report = pipeline.process_batch("mail", page, now).await?;
    println!("mail: {:?}", report);

    let triage = pipeline.triage();
    let alerts = triage.list_alerts(None, 20)?;
    for alert in &alerts {
        println!(
            "[{}] {} {:.2} {}",
            alert.state, alert.alert_type, alert.score, alert.title
        );
    }

    if let Some(first) = alerts.iter().find(|a| a.state == AlertState::Delivered) {
        let resolved = triage.record_feedback(&first.alert_id, FeedbackAction::Actioned, now)?;
        println!("after feedback: {} is {}", resolved.alert_id, resolved.state);
    }

    let _ = std::fs::remove_file(&db);
    Ok(())
}
