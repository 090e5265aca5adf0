//! Poll pacing and failure isolation for source loops.

use std::time::{Duration, Instant};

/// Poll interval that backs off while a source is quiet.
///
/// Resets to `min` after a poll that returned events, doubles after one that
/// returned nothing, and never leaves `[min, max]`.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_change(&mut self) -> Duration {
        self.current = self.min;
        self.current
    }

    pub fn on_idle(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).clamp(self.min, self.max);
        self.current
    }
}

/// Trips after `threshold` consecutive failures and rejects polls for the
/// cooldown. After the cooldown one probe is let through; a failed probe
/// re-opens the circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// `Err(remaining)` while the circuit is open.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.opened_at {
            Some(opened) => {
                let elapsed = now.saturating_duration_since(opened);
                if elapsed < self.cooldown {
                    Err(self.cooldown - elapsed)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.check(now).is_err()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            let was_closed = self.opened_at.is_none();
            self.opened_at = Some(now);
            return was_closed;
        }
        false
    }
}
