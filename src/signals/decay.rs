//! Temporal decay (pure math, no DB).

use chrono::{DateTime, Utc};

/// Exponential half-life decay: `base * 2^(-age_days / half_life_days)`.
///
/// Negative ages (timestamps in the future) count as zero.
pub fn decayed_weight(base_weight: f64, age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 || age_days <= 0.0 {
        return base_weight;
    }
    base_weight * (2.0_f64).powf(-age_days / half_life_days)
}

/// Fractional days from `then` to `now`, never negative.
pub fn age_days(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - then).num_milliseconds() as f64 / 1000.0;
    (secs / 86400.0).max(0.0)
}
