//! Importance scoring: recency decay, explicit priority and interest match.

use chrono::{DateTime, Utc};

use crate::entity::{AttrValue, Attributes};
use crate::signals::decay::{age_days, decayed_weight};
use crate::types::ImportanceConfig;

/// Explicit priority in `[0, 1]` from well-known attributes; the strongest
/// wins.
pub fn priority_signal(attributes: &Attributes) -> f64 {
    let mut signal: f64 = 0.0;

    for flag in ["flagged", "important", "starred", "urgent"] {
        if attributes
            .get(flag)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false)
        {
            signal = signal.max(1.0);
        }
    }

    if let Some(priority) = attributes.get("priority") {
        let value = match priority {
            AttrValue::Text(s) => match s.trim().to_lowercase().as_str() {
                "urgent" | "critical" => Some(1.0),
                "high" => Some(0.8),
                "medium" | "normal" => Some(0.5),
                "low" => Some(0.2),
                other => other.parse::<f64>().ok().map(scale_numeric_priority),
            },
            other => other.as_f64().map(scale_numeric_priority),
        };
        if let Some(v) = value {
            signal = signal.max(v);
        }
    }

    if let Some(seniority) = attributes.get("sender_seniority").and_then(AttrValue::as_f64) {
        signal = signal.max(seniority.clamp(0.0, 1.0));
    }

    signal
}

/// Numbers in `[0, 1]` are taken as-is; `1..=5` scales linearly.
fn scale_numeric_priority(n: f64) -> f64 {
    if (0.0..=1.0).contains(&n) {
        n
    } else {
        ((n.clamp(1.0, 5.0) - 1.0) / 4.0).clamp(0.0, 1.0)
    }
}

/// Fraction of interests found in `text`; two hits saturate.
pub fn interest_match(text: &str, interests: &[String]) -> f64 {
    if interests.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = interests
        .iter()
        .map(|i| i.trim().to_lowercase())
        .filter(|i| !i.is_empty() && haystack.contains(i.as_str()))
        .count();
    (hits as f64 / 2.0).min(1.0)
}

/// `w_recency * 2^(-age/half_life) + w_priority * priority + w_interest * interest`,
/// clamped to `[0, 1]`.
pub fn score(
    config: &ImportanceConfig,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    attributes: &Attributes,
    text: &str,
) -> f64 {
    let recency = decayed_weight(1.0, age_days(timestamp, now), config.half_life_days);
    let raw = config.recency_weight * recency
        + config.priority_weight * priority_signal(attributes)
        + config.interest_weight * interest_match(text, &config.interests);
    raw.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_importance_decays_monotonically_with_age() {
        let config = ImportanceConfig::default();
        let now = Utc::now();
        let attributes = Attributes::new();
        let mut last = f64::MAX;
        for days in [0, 1, 3, 7, 14, 30, 90] {
            let s = score(&config, now - Duration::days(days), now, &attributes, "");
            assert!(s <= last, "importance must not rise with age");
            last = s;
        }
        let fresh = score(&config, now, now, &attributes, "");
        let week = score(&config, now - Duration::days(7), now, &attributes, "");
        assert!((fresh - 0.45).abs() < 1e-9);
        assert!((week - 0.225).abs() < 1e-9);
    }

    #[test]
    fn test_future_timestamp_counts_as_now() {
        let config = ImportanceConfig::default();
        let now = Utc::now();
        let a = score(&config, now + Duration::days(3), now, &Attributes::new(), "");
        let b = score(&config, now, now, &Attributes::new(), "");
        assert_eq!(a, b);
    }

    #[test]
    fn test_priority_signal_sources() {
        assert_eq!(priority_signal(&attrs(&[("flagged", AttrValue::Bool(true))])), 1.0);
        assert_eq!(
            priority_signal(&attrs(&[("priority", AttrValue::Text("high".to_string()))])),
            0.8
        );
        assert_eq!(priority_signal(&attrs(&[("priority", AttrValue::Int(5))])), 1.0);
        assert_eq!(priority_signal(&attrs(&[("priority", AttrValue::Float(0.3))])), 0.3);
        assert_eq!(priority_signal(&Attributes::new()), 0.0);
    }

    #[test]
    fn test_score_is_clamped() {
        let config = ImportanceConfig {
            recency_weight: 1.0,
            priority_weight: 1.0,
            interest_weight: 1.0,
            interests: vec!["rust".to_string()],
            ..ImportanceConfig::default()
        };
        let now = Utc::now();
        let s = score(
            &config,
            now,
            now,
            &attrs(&[("urgent", AttrValue::Bool(true))]),
            "Rust meetup",
        );
        assert_eq!(s, 1.0);
    }

    #[test]
    fn test_interest_match_saturates() {
        let interests = vec!["budget".to_string(), "hiring".to_string(), "roadmap".to_string()];
        assert_eq!(interest_match("Budget review", &interests), 0.5);
        assert_eq!(interest_match("budget, hiring and roadmap", &interests), 1.0);
    }
}
