//! Hand-written rule priors and the triage feature vector.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::proactive::CandidateAlert;
use crate::types::Config;

/// One-hot buckets for the alert type.
pub const TYPE_BUCKETS: usize = 4;

/// raw confidence, evidence size, priority, urgency, in working hours,
/// then the type buckets.
pub const FEATURE_COUNT: usize = 5 + TYPE_BUCKETS;

/// Evidence sets at or above this size saturate the feature.
const EVIDENCE_SATURATION: f64 = 10.0;

/// Stable bucket for an alert type.
pub fn type_bucket(alert_type: &str) -> usize {
    let digest = Sha256::digest(alert_type.as_bytes());
    digest[0] as usize % TYPE_BUCKETS
}

/// Feature vector for a candidate at `now`.
pub fn features(candidate: &CandidateAlert, config: &Config, now: DateTime<Utc>) -> Vec<f64> {
    let mut out = Vec::with_capacity(FEATURE_COUNT);
    out.push(candidate.raw_confidence.clamp(0.0, 1.0));
    out.push((candidate.evidence.len() as f64 / EVIDENCE_SATURATION).min(1.0));
    out.push(candidate.priority.weight());
    out.push(if candidate.urgent { 1.0 } else { 0.0 });
    out.push(if config.working_hours.contains(now) { 1.0 } else { 0.0 });
    let bucket = type_bucket(&candidate.alert_type);
    out.extend((0..TYPE_BUCKETS).map(|i| if i == bucket { 1.0 } else { 0.0 }));
    out
}

/// Non-urgent candidates outside working hours are never delivered.
pub fn off_hours_gated(candidate: &CandidateAlert, config: &Config, now: DateTime<Utc>) -> bool {
    !candidate.urgent && !config.working_hours.contains(now)
}

/// The configured prior for the candidate's type. Outside working hours the
/// prior is zero unless the candidate is urgent.
pub fn rule_prior(candidate: &CandidateAlert, config: &Config, now: DateTime<Utc>) -> f64 {
    if off_hours_gated(candidate, config, now) {
        return 0.0;
    }
    config.detectors.prior_for(&candidate.alert_type)
}

/// Weight given to the learned model: grows with its training size and
/// never exceeds the configured cap.
pub fn learned_weight(config: &Config, training_size: usize) -> f64 {
    let n = training_size as f64;
    if n <= 0.0 {
        return 0.0;
    }
    let ramp = config.learned_weight_ramp.max(0.0);
    (config.learned_weight_cap * n / (n + ramp)).clamp(0.0, 1.0)
}

/// Blend the prior with the learned score.
pub fn blend(prior: f64, learned: f64, weight: f64) -> f64 {
    ((1.0 - weight) * prior + weight * learned).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactive::AlertPriority;
    use chrono::TimeZone;

    fn candidate(alert_type: &str, urgent: bool) -> CandidateAlert {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let mut c = CandidateAlert::new(alert_type, alert_type, at);
        c.urgent = urgent;
        c.priority = AlertPriority::High;
        c.raw_confidence = 0.9;
        c.evidence = ["a".to_string(), "b".to_string()].into_iter().collect();
        c
    }

    #[test]
    fn test_prior_gated_outside_working_hours() {
        let config = Config::default();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 10, 19, 21, 0, 0).unwrap();

        let c = candidate("unsaved-document-before-meeting", false);
        assert!((rule_prior(&c, &config, monday) - 0.8).abs() < f64::EPSILON);
        assert_eq!(rule_prior(&c, &config, sunday), 0.0);
        assert_eq!(rule_prior(&c, &config, late), 0.0);

        let urgent = candidate("unsaved-document-before-meeting", true);
        assert!((rule_prior(&urgent, &config, sunday) - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_features_shape() {
        let config = Config::default();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        let f = features(&candidate("schedule-conflict", false), &config, now);
        assert_eq!(f.len(), FEATURE_COUNT);
        assert!((f[1] - 0.2).abs() < 1e-9);
        assert_eq!(f[4], 1.0);
        assert_eq!(f[5..].iter().filter(|v| **v == 1.0).count(), 1);
    }

    #[test]
    fn test_learned_weight_ramps_to_cap() {
        let config = Config::default();
        assert_eq!(learned_weight(&config, 0), 0.0);
        assert!((learned_weight(&config, 100) - 0.25).abs() < 1e-9);
        assert!(learned_weight(&config, 1_000_000) <= config.learned_weight_cap);
        assert_eq!(blend(0.8, 0.1, 0.0), 0.8);
    }
}
