//! Background retraining of the triage model.
//!
//! Runs when enough new feedback has accumulated, or when the last retrain is
//! old and at least one new record exists. Single-flight: a trigger that
//! arrives while a retrain is running returns `AlreadyRunning`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::model::{ModelTrainer, TrainingExample, TriageModel};
use super::Triage;
use crate::db::parse_ts;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    NotDue,
    AlreadyRunning,
    Trained {
        version: i64,
        training_size: usize,
        validation_loss: f64,
    },
    /// Validation failed; the previous model stays active.
    Rejected(String),
}

impl Triage {
    fn trainer(&self) -> ModelTrainer {
        ModelTrainer {
            min_examples: self.config.min_training_examples,
            holdout_fraction: self.config.holdout_fraction,
            ..ModelTrainer::default()
        }
    }

    /// Whether the feedback or time trigger has fired.
    pub fn retrain_due(&self, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let (state, new_feedback) = self.memory.with_reader(|db| {
            let state = db.get_retrain_state()?;
            let n = db.count_feedback_since(state.last_feedback_rowid)?;
            Ok((state, n))
        })?;
        if new_feedback == 0 {
            return Ok(false);
        }
        if new_feedback >= self.config.retrain_feedback_threshold {
            return Ok(true);
        }
        let elapsed = match state.last_retrain_at.as_deref() {
            Some(at) => now - parse_ts(at)?,
            None => return Ok(true),
        };
        Ok(elapsed >= Duration::hours(self.config.retrain_time_threshold_hours))
    }

    /// Retrain if a trigger has fired.
    pub async fn maybe_retrain(&self, now: DateTime<Utc>) -> Result<RetrainOutcome, PipelineError> {
        if !self.retrain_due(now)? {
            return Ok(RetrainOutcome::NotDue);
        }
        self.retrain(now).await
    }

    /// Train on the full feedback log and swap the model in if it validates.
    pub async fn retrain(&self, now: DateTime<Utc>) -> Result<RetrainOutcome, PipelineError> {
        let Ok(_guard) = self.retrain_lock.try_lock() else {
            log::debug!("Triage: retrain already running");
            return Ok(RetrainOutcome::AlreadyRunning);
        };

        let (rows, watermark) = self.memory.with_reader(|db| {
            Ok((db.feedback_examples()?, db.max_feedback_rowid()?))
        })?;
        let examples: Vec<TrainingExample> = rows.iter().map(TrainingExample::from).collect();
        let active: Arc<dyn TriageModel> = self.active_model();
        let trainer = self.trainer();
        log::info!(
            "Triage: retraining on {} examples (active model has {})",
            examples.len(),
            active.training_size()
        );

        let result = tokio::task::spawn_blocking(move || trainer.retrain(&examples, active.as_ref()))
            .await
            .map_err(|e| PipelineError::RetrainValidationFailed(format!("trainer task: {}", e)))?;

        match result {
            Ok(trained) => {
                let weights_json = serde_json::to_string(&trained.model)
                    .map_err(|e| PipelineError::RetrainValidationFailed(e.to_string()))?;
                let training_size = trained.model.training_size;
                let version = self.memory.with_writer(|db| {
                    db.with_transaction(|tx| {
                        let version = tx.activate_model(
                            trained.model.kind(),
                            &weights_json,
                            training_size,
                            Some(trained.validation_loss),
                            &now,
                        )?;
                        tx.record_retrain(&now, watermark, "trained")?;
                        Ok(version)
                    })
                })?;
                self.swap_model(Arc::new(trained.model));
                log::info!(
                    "Triage: model v{} active (holdout log-loss {:.4}, was {:.4})",
                    version,
                    trained.validation_loss,
                    trained.active_loss
                );
                Ok(RetrainOutcome::Trained {
                    version,
                    training_size,
                    validation_loss: trained.validation_loss,
                })
            }
            Err(PipelineError::RetrainValidationFailed(reason)) => {
                log::warn!("Triage: RetrainValidationFailed: {}", reason);
                self.memory.with_writer(|db| {
                    db.record_retrain(&now, watermark, &format!("rejected: {}", reason))
                })?;
                Ok(RetrainOutcome::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactive::{AlertPriority, CandidateAlert};
    use crate::triage::test_utils::test_triage_with;
    use crate::triage::FeedbackAction;
    use crate::types::Config;
    use chrono::TimeZone;

    fn monday_10am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.min_training_examples = 20;
        config.retrain_feedback_threshold = 10;
        config
    }

    /// Deliver `n` alerts and give feedback: high-priority ones get actioned,
    /// low-priority ones dismissed.
    fn seed_feedback(triage: &Triage, n: usize, start: DateTime<Utc>) {
        for i in 0..n {
            let at = start + Duration::minutes(i as i64);
            let mut c = CandidateAlert::new("schedule-conflict", "schedule-conflict", at);
            c.subject = Some(format!("pair-{}", i));
            c.evidence = [format!("m{}", i)].into_iter().collect();
            let useful = i % 2 == 0;
            c.priority = if useful { AlertPriority::Critical } else { AlertPriority::Low };
            c.raw_confidence = if useful { 0.95 } else { 0.5 };
            let outcome = triage.process(&c, at).expect("process");
            let action = if useful {
                FeedbackAction::Actioned
            } else {
                FeedbackAction::Dismissed
            };
            triage
                .record_feedback(&outcome.alert().alert_id, action, at)
                .expect("feedback");
        }
    }

    #[tokio::test]
    async fn test_not_due_without_feedback() {
        let triage = test_triage_with(config());
        let outcome = triage.maybe_retrain(monday_10am()).await.expect("retrain");
        assert_eq!(outcome, RetrainOutcome::NotDue);
    }

    #[tokio::test]
    async fn test_retrain_swaps_model() {
        let triage = test_triage_with(config());
        seed_feedback(&triage, 30, monday_10am());
        assert!(triage.retrain_due(monday_10am()).expect("due"));

        let outcome = triage.maybe_retrain(monday_10am()).await.expect("retrain");
        match outcome {
            RetrainOutcome::Trained { training_size, .. } => assert_eq!(training_size, 30),
            other => panic!("expected Trained, got {:?}", other),
        }
        assert_eq!(triage.active_model().training_size(), 30);
        assert_eq!(triage.active_model().kind(), "logistic");
        assert!(!triage.retrain_due(monday_10am()).expect("due"));
    }

    #[tokio::test]
    async fn test_too_little_feedback_keeps_model() {
        let triage = test_triage_with(config());
        seed_feedback(&triage, 12, monday_10am());
        let outcome = triage.maybe_retrain(monday_10am()).await.expect("retrain");
        assert!(matches!(outcome, RetrainOutcome::Rejected(_)));
        assert_eq!(triage.active_model().kind(), "neutral");
        // Watermark moved, so the same feedback does not retrigger.
        assert!(!triage.retrain_due(monday_10am()).expect("due"));
    }

    #[tokio::test]
    async fn test_concurrent_retrain_is_single_flight() {
        let triage = test_triage_with(config());
        seed_feedback(&triage, 30, monday_10am());
        let _running = triage.retrain_lock.lock().await;
        let outcome = triage.retrain(monday_10am()).await.expect("retrain");
        assert_eq!(outcome, RetrainOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_time_trigger_needs_new_feedback() {
        let triage = test_triage_with(config());
        seed_feedback(&triage, 30, monday_10am());
        triage.retrain(monday_10am()).await.expect("first");

        let tomorrow = monday_10am() + Duration::hours(25);
        assert!(!triage.retrain_due(tomorrow).expect("due"));
        seed_feedback(&triage, 1, tomorrow);
        assert!(triage.retrain_due(tomorrow).expect("due"));
    }
}
