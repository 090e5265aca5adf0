//! Delivery of triaged alerts.
//!
//! The pipeline only knows the `Delivery` contract; channels (notification
//! center, chat, mail) live outside the core. `LogDelivery` is the default
//! sink.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::triage::Alert;

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), PipelineError>;

    fn name(&self) -> &str;
}

/// Writes delivered alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, alert: &Alert) -> Result<(), PipelineError> {
        log::info!(
            "Delivery: [{}] {}: {} (score {:.2})",
            alert.priority.as_str(),
            alert.title,
            alert.message,
            alert.score
        );
        for action in &alert.suggested_actions {
            log::info!("Delivery:   - {}", action);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(exponent)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempts: u32,
    pub delivered: bool,
    pub last_error: Option<String>,
}

/// Hand `alert` to `delivery`, retrying retryable failures with doubling
/// backoff. Non-retryable errors stop immediately.
pub async fn dispatch_with_retry(
    delivery: &dyn Delivery,
    alert: &Alert,
    policy: &RetryPolicy,
) -> DispatchReport {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match delivery.deliver(alert).await {
            Ok(()) => {
                return DispatchReport {
                    attempts: attempt,
                    delivered: true,
                    last_error: None,
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                last_error = Some(e.to_string());
                if !retryable || attempt == attempts {
                    log::warn!(
                        "Delivery: {} gave up on {} after {} attempts: {}",
                        delivery.name(),
                        alert.alert_id,
                        attempt,
                        e
                    );
                    return DispatchReport {
                        attempts: attempt,
                        delivered: false,
                        last_error,
                    };
                }
                let delay = policy.delay(attempt);
                log::warn!(
                    "Delivery: retry {}/{} for {} after error: {} (sleep {:?})",
                    attempt,
                    attempts,
                    alert.alert_id,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    DispatchReport {
        attempts,
        delivered: false,
        last_error,
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Fails the first `failures` calls with a retryable error, then records
    /// every delivered alert id.
    #[derive(Default)]
    pub struct RecordingDelivery {
        pub failures: u32,
        pub calls: AtomicU32,
        pub delivered: Mutex<Vec<String>>,
    }

    impl RecordingDelivery {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        pub fn delivered_ids(&self) -> Vec<String> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, alert: &Alert) -> Result<(), PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PipelineError::DeliveryFailed {
                    alert_id: alert.alert_id.clone(),
                    message: "channel unavailable".to_string(),
                });
            }
            self.delivered.lock().push(alert.alert_id.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }
}
