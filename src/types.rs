//! Configuration types, read from `~/.foresight/config.json`.
//!
//! Every field has a serde default so a partial (or empty) config file is
//! valid. `Config::validate` rejects values the pipeline cannot honour.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Override for the database location (defaults to `~/.foresight/foresight.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,

    // Entity resolution + relationship discovery
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_relationship_threshold")]
    pub relationship_threshold: f64,
    #[serde(default = "default_resolution_window_hours")]
    pub resolution_window_hours: i64,
    #[serde(default = "default_relationship_window_days")]
    pub relationship_window_days: i64,
    #[serde(default = "default_relationship_scan_limit")]
    pub relationship_scan_limit: usize,
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
    #[serde(default)]
    pub importance: ImportanceConfig,

    // Retention
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_low_importance_floor")]
    pub low_importance_floor: f64,
    #[serde(default = "default_summary_band_ceiling")]
    pub summary_band_ceiling: f64,

    // Triage
    #[serde(default = "default_min_alert_confidence")]
    pub min_alert_confidence: f64,
    #[serde(default = "default_alert_cooldown_minutes")]
    pub alert_cooldown_minutes: i64,
    #[serde(default)]
    pub working_hours: WorkingHours,
    #[serde(default)]
    pub detectors: DetectorConfig,
    #[serde(default = "default_feedback_timeout_hours")]
    pub feedback_timeout_hours: i64,
    #[serde(default = "default_retrain_feedback_threshold")]
    pub retrain_feedback_threshold: usize,
    #[serde(default = "default_retrain_time_threshold_hours")]
    pub retrain_time_threshold_hours: i64,
    #[serde(default = "default_min_training_examples")]
    pub min_training_examples: usize,
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    #[serde(default = "default_learned_weight_cap")]
    pub learned_weight_cap: f64,
    #[serde(default = "default_learned_weight_ramp")]
    pub learned_weight_ramp: f64,
    #[serde(default = "default_delivery_max_attempts")]
    pub delivery_max_attempts: u32,

    // I/O bounds
    #[serde(default = "default_connector_timeout_secs")]
    pub connector_timeout_secs: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,

    /// Cron expression (seconds field first) for compaction, pruning,
    /// backfill and the retrain check.
    #[serde(default = "default_maintenance_cron")]
    pub maintenance_cron: String,
}

fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_relationship_threshold() -> f64 {
    0.6
}
fn default_resolution_window_hours() -> i64 {
    72
}
fn default_relationship_window_days() -> i64 {
    14
}
fn default_relationship_scan_limit() -> usize {
    200
}
fn default_max_summary_chars() -> usize {
    2000
}
fn default_retention_days() -> i64 {
    90
}
fn default_low_importance_floor() -> f64 {
    0.3
}
fn default_summary_band_ceiling() -> f64 {
    0.6
}
fn default_min_alert_confidence() -> f64 {
    0.7
}
fn default_alert_cooldown_minutes() -> i64 {
    60
}
fn default_feedback_timeout_hours() -> i64 {
    24
}
fn default_retrain_feedback_threshold() -> usize {
    50
}
fn default_retrain_time_threshold_hours() -> i64 {
    24
}
fn default_min_training_examples() -> usize {
    20
}
fn default_holdout_fraction() -> f64 {
    0.2
}
fn default_learned_weight_cap() -> f64 {
    0.5
}
fn default_learned_weight_ramp() -> f64 {
    100.0
}
fn default_delivery_max_attempts() -> u32 {
    3
}
fn default_connector_timeout_secs() -> u64 {
    30
}
fn default_embedding_timeout_secs() -> u64 {
    10
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_cooldown_secs() -> u64 {
    300
}
fn default_maintenance_cron() -> String {
    "0 0 * * * *".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            db_path: None,
            similarity_threshold: default_similarity_threshold(),
            relationship_threshold: default_relationship_threshold(),
            resolution_window_hours: default_resolution_window_hours(),
            relationship_window_days: default_relationship_window_days(),
            relationship_scan_limit: default_relationship_scan_limit(),
            max_summary_chars: default_max_summary_chars(),
            importance: ImportanceConfig::default(),
            retention_days: default_retention_days(),
            low_importance_floor: default_low_importance_floor(),
            summary_band_ceiling: default_summary_band_ceiling(),
            min_alert_confidence: default_min_alert_confidence(),
            alert_cooldown_minutes: default_alert_cooldown_minutes(),
            working_hours: WorkingHours::default(),
            detectors: DetectorConfig::default(),
            feedback_timeout_hours: default_feedback_timeout_hours(),
            retrain_feedback_threshold: default_retrain_feedback_threshold(),
            retrain_time_threshold_hours: default_retrain_time_threshold_hours(),
            min_training_examples: default_min_training_examples(),
            holdout_fraction: default_holdout_fraction(),
            learned_weight_cap: default_learned_weight_cap(),
            learned_weight_ramp: default_learned_weight_ramp(),
            delivery_max_attempts: default_delivery_max_attempts(),
            connector_timeout_secs: default_connector_timeout_secs(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_circuit_breaker_cooldown_secs(),
            maintenance_cron: default_maintenance_cron(),
        }
    }
}

impl Config {
    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        let unit = [
            ("similarityThreshold", self.similarity_threshold),
            ("relationshipThreshold", self.relationship_threshold),
            ("lowImportanceFloor", self.low_importance_floor),
            ("summaryBandCeiling", self.summary_band_ceiling),
            ("minAlertConfidence", self.min_alert_confidence),
            ("holdoutFraction", self.holdout_fraction),
            ("learnedWeightCap", self.learned_weight_cap),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        for (alert_type, prior) in &self.detectors.priors {
            if !(0.0..=1.0).contains(prior) {
                return Err(format!("prior for {} must be within [0, 1]", alert_type));
            }
        }
        if self.summary_band_ceiling < self.low_importance_floor {
            return Err("summaryBandCeiling must not be below lowImportanceFloor".to_string());
        }
        if self.retention_days <= 0 {
            return Err("retentionDays must be positive".to_string());
        }
        if self.alert_cooldown_minutes <= 0 {
            return Err("alertCooldownMinutes must be positive".to_string());
        }
        if self.learned_weight_ramp <= 0.0 {
            return Err("learnedWeightRamp must be positive".to_string());
        }
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err("source id must not be empty".to_string());
            }
            if source.poll_interval_min_secs == 0
                || source.poll_interval_min_secs > source.poll_interval_max_secs
            {
                return Err(format!(
                    "source {}: pollIntervalMinSecs must be > 0 and <= pollIntervalMaxSecs",
                    source.id
                ));
            }
        }
        self.working_hours.validate()?;
        cron::Schedule::from_str(&self.maintenance_cron)
            .map_err(|e| format!("maintenanceCron '{}': {}", self.maintenance_cron, e))?;
        Ok(())
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.alert_cooldown_minutes)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

// =============================================================================
// Sources
// =============================================================================

/// One connector instance. `path` is used by the JSON-lines file connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_poll_interval_min_secs")]
    pub poll_interval_min_secs: u64,
    #[serde(default = "default_poll_interval_max_secs")]
    pub poll_interval_max_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval_min_secs() -> u64 {
    30
}
fn default_poll_interval_max_secs() -> u64 {
    900
}

// =============================================================================
// Working hours
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingHours {
    #[serde(default = "default_work_start")]
    pub start: String,
    #[serde(default = "default_work_end")]
    pub end: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
}

fn default_work_start() -> String {
    "09:00".to_string()
}
fn default_work_end() -> String {
    "18:00".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start: default_work_start(),
            end: default_work_end(),
            timezone: default_timezone(),
            weekdays_only: true,
        }
    }
}

impl WorkingHours {
    fn parsed(&self) -> Result<(NaiveTime, NaiveTime, Tz), String> {
        let start = NaiveTime::parse_from_str(&self.start, "%H:%M")
            .map_err(|e| format!("workingHours.start '{}': {}", self.start, e))?;
        let end = NaiveTime::parse_from_str(&self.end, "%H:%M")
            .map_err(|e| format!("workingHours.end '{}': {}", self.end, e))?;
        let tz = Tz::from_str(&self.timezone)
            .map_err(|e| format!("workingHours.timezone '{}': {}", self.timezone, e))?;
        Ok((start, end, tz))
    }

    pub fn validate(&self) -> Result<(), String> {
        let (start, end, _) = self.parsed()?;
        if start == end {
            return Err("workingHours.start and end must differ".to_string());
        }
        Ok(())
    }

    /// Whether `now` falls inside the configured window. A window whose end is
    /// before its start wraps past midnight. Unparseable settings count as
    /// always-on so a bad config never silences every alert.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let Ok((start, end, tz)) = self.parsed() else {
            return true;
        };
        let local = now.with_timezone(&tz);
        if self.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }
}

// =============================================================================
// Importance scoring
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportanceConfig {
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f64,
    #[serde(default = "default_interest_weight")]
    pub interest_weight: f64,
    /// User-declared interests matched against entity text.
    #[serde(default)]
    pub interests: Vec<String>,
}

fn default_half_life_days() -> f64 {
    7.0
}
fn default_recency_weight() -> f64 {
    0.45
}
fn default_priority_weight() -> f64 {
    0.35
}
fn default_interest_weight() -> f64 {
    0.20
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            recency_weight: default_recency_weight(),
            priority_weight: default_priority_weight(),
            interest_weight: default_interest_weight(),
            interests: Vec::new(),
        }
    }
}

// =============================================================================
// Detectors
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Rule prior per alert type; unlisted types use the built-in table.
    #[serde(default)]
    pub priors: HashMap<String, f64>,
    /// Detector names to skip.
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default = "default_meeting_lookahead_minutes")]
    pub meeting_lookahead_minutes: i64,
    #[serde(default = "default_unsaved_stale_minutes")]
    pub unsaved_stale_minutes: i64,
    #[serde(default = "default_project_mention_threshold")]
    pub project_mention_threshold: usize,
    #[serde(default = "default_project_mention_window_days")]
    pub project_mention_window_days: i64,
    #[serde(default = "default_communication_load_daily")]
    pub communication_load_daily: usize,
    #[serde(default = "default_communication_load_days")]
    pub communication_load_days: i64,
    #[serde(default = "default_follow_up_window_hours")]
    pub follow_up_window_hours: i64,
}

fn default_meeting_lookahead_minutes() -> i64 {
    120
}
fn default_unsaved_stale_minutes() -> i64 {
    120
}
fn default_project_mention_threshold() -> usize {
    3
}
fn default_project_mention_window_days() -> i64 {
    7
}
fn default_communication_load_daily() -> usize {
    30
}
fn default_communication_load_days() -> i64 {
    3
}
fn default_follow_up_window_hours() -> i64 {
    24
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            priors: HashMap::new(),
            disabled: Vec::new(),
            meeting_lookahead_minutes: default_meeting_lookahead_minutes(),
            unsaved_stale_minutes: default_unsaved_stale_minutes(),
            project_mention_threshold: default_project_mention_threshold(),
            project_mention_window_days: default_project_mention_window_days(),
            communication_load_daily: default_communication_load_daily(),
            communication_load_days: default_communication_load_days(),
            follow_up_window_hours: default_follow_up_window_hours(),
        }
    }
}

impl DetectorConfig {
    /// Rule prior for an alert type: configured value, else the built-in table.
    pub fn prior_for(&self, alert_type: &str) -> f64 {
        if let Some(prior) = self.priors.get(alert_type) {
            return prior.clamp(0.0, 1.0);
        }
        match alert_type {
            "schedule-conflict" => 0.85,
            "unsaved-document-before-meeting" => 0.8,
            "untracked-project" => 0.75,
            "meeting-follow-up" => 0.65,
            "meeting-reminder" => 0.7,
            "communication-load" => 0.6,
            _ => 0.5,
        }
    }

    pub fn is_enabled(&self, detector: &str) -> bool {
        !self.disabled.iter().any(|d| d == detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.retention_days, 90);
        assert!((config.min_alert_confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.alert_cooldown_minutes, 60);
        assert_eq!(config.working_hours.start, "09:00");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_fields() {
        let config: Config = serde_json::from_str(
            r#"{"minAlertConfidence": 0.8, "retentionDays": 30,
                "sources": [{"id": "calendar", "pollIntervalMinSecs": 10}],
                "detectors": {"priors": {"schedule-conflict": 0.9}}}"#,
        )
        .expect("parse");
        assert!((config.min_alert_confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.sources[0].poll_interval_min_secs, 10);
        assert_eq!(config.sources[0].poll_interval_max_secs, 900);
        assert!((config.detectors.prior_for("schedule-conflict") - 0.9).abs() < 1e-9);
        assert!((config.detectors.prior_for("untracked-project") - 0.75).abs() < 1e-9);
        assert!((config.detectors.prior_for("meeting-reminder") - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = Config {
            min_alert_confidence: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            low_importance_floor: 0.7,
            summary_band_ceiling: 0.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            maintenance_cron: "not a cron".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_working_hours_window() {
        let hours = WorkingHours::default();
        // 2026-10-19 is a Monday
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap()));
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()));
        // Sunday
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap()));
    }

    #[test]
    fn test_working_hours_timezone_and_wrap() {
        let hours = WorkingHours {
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            timezone: "America/New_York".to_string(),
            weekdays_only: false,
        };
        // 03:00 UTC on Oct 20 = 23:00 EDT on Oct 19
        assert!(hours.contains(Utc.with_ymd_and_hms(2026, 10, 20, 3, 0, 0).unwrap()));
        // 16:00 UTC = 12:00 EDT
        assert!(!hours.contains(Utc.with_ymd_and_hms(2026, 10, 20, 16, 0, 0).unwrap()));
    }
}
