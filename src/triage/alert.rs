//! Alert records, their lifecycle, and identity.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::proactive::{fingerprint, AlertPriority, CandidateAlert};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Scored,
    Delivered,
    Suppressed,
    Actioned,
    Dismissed,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Scored => "scored",
            AlertState::Delivered => "delivered",
            AlertState::Suppressed => "suppressed",
            AlertState::Actioned => "actioned",
            AlertState::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scored" => Some(AlertState::Scored),
            "delivered" => Some(AlertState::Delivered),
            "suppressed" => Some(AlertState::Suppressed),
            "actioned" => Some(AlertState::Actioned),
            "dismissed" => Some(AlertState::Dismissed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlertState::Suppressed | AlertState::Actioned | AlertState::Dismissed
        )
    }

    /// Allowed lifecycle moves. Terminal states have no exits.
    pub fn can_transition_to(&self, next: AlertState) -> bool {
        matches!(
            (self, next),
            (AlertState::Scored, AlertState::Delivered)
                | (AlertState::Scored, AlertState::Suppressed)
                | (AlertState::Delivered, AlertState::Actioned)
                | (AlertState::Delivered, AlertState::Dismissed)
        )
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user did with a delivered alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackAction {
    Actioned,
    Dismissed,
    /// No reaction within the feedback timeout.
    Ignored,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Actioned => "actioned",
            FeedbackAction::Dismissed => "dismissed",
            FeedbackAction::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "actioned" => Some(FeedbackAction::Actioned),
            "dismissed" => Some(FeedbackAction::Dismissed),
            "ignored" => Some(FeedbackAction::Ignored),
            _ => None,
        }
    }

    /// Resulting alert state.
    pub fn target_state(&self) -> AlertState {
        match self {
            FeedbackAction::Actioned => AlertState::Actioned,
            FeedbackAction::Dismissed | FeedbackAction::Ignored => AlertState::Dismissed,
        }
    }

    /// Training label: only acting on an alert counts as useful.
    pub fn label(&self) -> f64 {
        match self {
            FeedbackAction::Actioned => 1.0,
            FeedbackAction::Dismissed | FeedbackAction::Ignored => 0.0,
        }
    }
}

/// A scored candidate, persisted with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub identity_key: String,
    pub alert_type: String,
    pub detector_id: String,
    pub evidence: BTreeSet<String>,
    pub raw_confidence: f64,
    pub score: f64,
    pub state: AlertState,
    pub priority: AlertPriority,
    pub title: String,
    pub message: String,
    pub suggested_actions: Vec<String>,
    /// Feature vector the score was computed from; reused for training.
    pub features: Vec<f64>,
    pub urgent: bool,
    /// Set when every delivery attempt failed. The alert stays `Delivered`.
    pub undelivered: bool,
    pub delivery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Whether a new candidate with the same identity folds into this record.
    pub fn absorbs_repeat(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if !self.state.is_terminal() {
            return true;
        }
        let horizon = now - cooldown;
        self.created_at >= horizon || self.resolved_at.map(|r| r >= horizon).unwrap_or(false)
    }

    /// Fold a repeat candidate in: union evidence, keep the stronger
    /// confidence. Score and state are left alone.
    pub fn absorb(&mut self, candidate: &CandidateAlert) {
        self.evidence.extend(candidate.evidence.iter().cloned());
        self.raw_confidence = self.raw_confidence.max(candidate.raw_confidence.clamp(0.0, 1.0));
        self.urgent |= candidate.urgent;
    }
}

/// Stable identity for a candidate: its subject when named, else its evidence.
pub fn identity_key(candidate: &CandidateAlert) -> String {
    match &candidate.subject {
        Some(subject) => fingerprint(&[&candidate.alert_type, "subject", subject]),
        None => {
            let mut parts = vec![candidate.alert_type.as_str(), "evidence"];
            parts.extend(candidate.evidence.iter().map(String::as_str));
            fingerprint(&parts)
        }
    }
}

/// Alert id: identity plus the cooldown bucket the alert was created in.
pub fn alert_id(identity_key: &str, created_at: DateTime<Utc>, cooldown: Duration) -> String {
    let width = cooldown.num_seconds().max(1);
    let bucket = created_at.timestamp().div_euclid(width);
    fingerprint(&[identity_key, &bucket.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(subject: Option<&str>, evidence: &[&str]) -> CandidateAlert {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let mut c = CandidateAlert::new("schedule-conflict", "schedule-conflict", at);
        c.subject = subject.map(str::to_string);
        c.evidence = evidence.iter().map(|s| s.to_string()).collect();
        c
    }

    #[test]
    fn test_transitions() {
        assert!(AlertState::Scored.can_transition_to(AlertState::Delivered));
        assert!(AlertState::Scored.can_transition_to(AlertState::Suppressed));
        assert!(AlertState::Delivered.can_transition_to(AlertState::Dismissed));
        assert!(!AlertState::Suppressed.can_transition_to(AlertState::Delivered));
        assert!(!AlertState::Actioned.can_transition_to(AlertState::Dismissed));
        assert!(!AlertState::Scored.can_transition_to(AlertState::Actioned));
    }

    #[test]
    fn test_ignored_feedback_dismisses() {
        assert_eq!(FeedbackAction::Ignored.target_state(), AlertState::Dismissed);
        assert_eq!(FeedbackAction::Ignored.label(), 0.0);
        assert_eq!(FeedbackAction::parse("ignored"), Some(FeedbackAction::Ignored));
    }

    #[test]
    fn test_identity_prefers_subject() {
        let a = candidate(Some("m1+m2"), &["m1", "m2"]);
        let b = candidate(Some("m1+m2"), &["m1", "m2", "m3"]);
        assert_eq!(identity_key(&a), identity_key(&b));

        let c = candidate(None, &["m1", "m2"]);
        let d = candidate(None, &["m2", "m1"]);
        let e = candidate(None, &["m1"]);
        assert_eq!(identity_key(&c), identity_key(&d));
        assert_ne!(identity_key(&c), identity_key(&e));
        assert_ne!(identity_key(&a), identity_key(&c));
    }

    #[test]
    fn test_alert_id_buckets_by_cooldown() {
        let cooldown = Duration::minutes(60);
        let t = Utc.with_ymd_and_hms(2026, 10, 19, 10, 5, 0).unwrap();
        assert_eq!(
            alert_id("k", t, cooldown),
            alert_id("k", t + Duration::minutes(30), cooldown)
        );
        assert_ne!(
            alert_id("k", t, cooldown),
            alert_id("k", t + Duration::minutes(60), cooldown)
        );
    }
}
