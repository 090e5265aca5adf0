//! Weighted log-odds fusion and the logistic helpers built on it.

/// Fuse multiple `(confidence, weight)` pairs.
///
/// Each signal contributes `weight * ln(p / (1 - p))`; the sum is mapped back
/// through the logistic function.
pub fn fuse_confidence(signals: &[(f64, f64)]) -> f64 {
    if signals.is_empty() {
        return 0.5;
    }

    if signals.len() == 1 {
        return signals[0].0.clamp(0.0, 1.0);
    }

    let weighted_log_odds_sum: f64 = signals
        .iter()
        .map(|&(confidence, weight)| weight * logit(confidence))
        .sum();

    sigmoid(weighted_log_odds_sum).clamp(0.0, 0.999)
}

/// Log-odds of `p`, with `p` clamped away from 0 and 1.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(0.01, 0.99);
    (p / (1.0 - p)).ln()
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Mean binary cross-entropy of predictions against 0/1 labels.
pub fn log_loss(predictions: &[f64], labels: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return f64::INFINITY;
    }
    let eps = 1e-9;
    let total: f64 = predictions
        .iter()
        .zip(labels)
        .map(|(&p, &y)| {
            let p = p.clamp(eps, 1.0 - eps);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / predictions.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_high_confidence_weighted() {
        let result = fuse_confidence(&[(0.8, 1.0), (0.9, 0.9)]);
        assert!(result > 0.95, "weighted compounding should exceed 0.95, got {}", result);
    }

    #[test]
    fn test_strong_dominates_weak_contradiction() {
        let result = fuse_confidence(&[(0.9, 1.0), (0.1, 0.4)]);
        assert!(
            result > 0.70 && result < 0.95,
            "strong should dominate weak contradiction, got {}",
            result
        );
    }

    #[test]
    fn test_single_signal_passthrough() {
        assert!((fuse_confidence(&[(0.75, 1.0)]) - 0.75).abs() < 0.001);
        assert!((fuse_confidence(&[]) - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_log_loss_prefers_correct_predictions() {
        let labels = [1.0, 0.0, 1.0];
        let good = log_loss(&[0.9, 0.1, 0.8], &labels);
        let bad = log_loss(&[0.2, 0.9, 0.3], &labels);
        assert!(good < bad);
        assert!((log_loss(&[0.5, 0.5], &[1.0, 0.0]) - std::f64::consts::LN_2).abs() < 1e-9);
    }
}
