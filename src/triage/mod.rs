//! Alert triage: dedup, scoring, the deliver/suppress decision and feedback.
//!
//! Every candidate goes through `process`:
//! 1. Its identity is looked up; a live or recent record absorbs it.
//! 2. Otherwise it is scored as a blend of the rule prior and the active
//!    learned model, then marked Delivered or Suppressed.
//!
//! The active model sits behind an `RwLock<Arc<..>>` so a retrain swaps it
//! without blocking scoring.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::memory::VectorMemory;
use crate::proactive::CandidateAlert;
use crate::types::Config;

pub mod alert;
pub mod model;
pub mod retrain;
pub mod rules;

pub use alert::{alert_id, identity_key, Alert, AlertState, FeedbackAction};
pub use model::{
    model_from_db, LogisticModel, ModelTrainer, NeutralModel, TrainedModel, TrainingExample,
    TriageModel,
};
pub use retrain::RetrainOutcome;

/// What `process` did with a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum TriageOutcome {
    /// New alert, now Delivered (to be dispatched) or Suppressed.
    Created(Alert),
    /// Folded into an existing alert; nothing to dispatch.
    Merged(Alert),
}

impl TriageOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            TriageOutcome::Created(a) | TriageOutcome::Merged(a) => a,
        }
    }

    /// The alert, if it still needs to be handed to delivery.
    pub fn to_deliver(&self) -> Option<&Alert> {
        match self {
            TriageOutcome::Created(a) if a.state == AlertState::Delivered => Some(a),
            _ => None,
        }
    }
}

pub struct Triage {
    memory: Arc<VectorMemory>,
    config: Arc<Config>,
    model: RwLock<Arc<dyn TriageModel>>,
    retrain_lock: Mutex<()>,
}

impl Triage {
    /// Load the active model from the store, falling back to neutral.
    pub fn new(memory: Arc<VectorMemory>, config: Arc<Config>) -> Result<Self, PipelineError> {
        let stored = memory.with_reader(|db| db.active_model())?;
        let model: Arc<dyn TriageModel> = match stored {
            Some(row) => {
                log::info!(
                    "Triage: loaded model v{} ({} examples)",
                    row.version,
                    row.training_size
                );
                Arc::from(model_from_db(&row))
            }
            None => Arc::new(NeutralModel),
        };
        Ok(Self {
            memory,
            config,
            model: RwLock::new(model),
            retrain_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_model(&self) -> Arc<dyn TriageModel> {
        Arc::clone(&self.model.read())
    }

    fn swap_model(&self, model: Arc<dyn TriageModel>) {
        *self.model.write() = model;
    }

    /// Score a candidate: `(1 - w) * prior + w * learned`. The working-hours
    /// gate applies to the blended score, so no model can lift it.
    pub fn score(&self, candidate: &CandidateAlert, features: &[f64], now: DateTime<Utc>) -> f64 {
        if rules::off_hours_gated(candidate, &self.config, now) {
            return 0.0;
        }
        let prior = rules::rule_prior(candidate, &self.config, now);
        let model = self.active_model();
        let weight = rules::learned_weight(&self.config, model.training_size());
        if weight == 0.0 {
            return prior;
        }
        rules::blend(prior, model.score(features), weight)
    }

    /// Dedup, score and decide one candidate.
    pub fn process(
        &self,
        candidate: &CandidateAlert,
        now: DateTime<Utc>,
    ) -> Result<TriageOutcome, PipelineError> {
        let cooldown = self.config.cooldown();
        let identity = identity_key(candidate);
        let features = rules::features(candidate, &self.config, now);
        let score = self.score(candidate, &features, now);

        let outcome = self.memory.with_writer(|db| {
            db.with_transaction(|tx| {
                if let Some(mut existing) = tx.latest_alert_by_identity(&identity)? {
                    if existing.absorbs_repeat(now, cooldown) {
                        existing.absorb(candidate);
                        tx.save_alert(&existing)?;
                        return Ok(TriageOutcome::Merged(existing));
                    }
                }

                let state = if score >= self.config.min_alert_confidence {
                    AlertState::Delivered
                } else {
                    AlertState::Suppressed
                };
                let alert = Alert {
                    alert_id: alert_id(&identity, now, cooldown),
                    identity_key: identity.clone(),
                    alert_type: candidate.alert_type.clone(),
                    detector_id: candidate.detector_id.clone(),
                    evidence: candidate.evidence.clone(),
                    raw_confidence: candidate.raw_confidence.clamp(0.0, 1.0),
                    score,
                    state,
                    priority: candidate.priority,
                    title: candidate.title.clone(),
                    message: candidate.message.clone(),
                    suggested_actions: candidate.suggested_actions.clone(),
                    features: features.clone(),
                    urgent: candidate.urgent,
                    undelivered: false,
                    delivery_attempts: 0,
                    created_at: now,
                    delivered_at: (state == AlertState::Delivered).then_some(now),
                    resolved_at: (state == AlertState::Suppressed).then_some(now),
                };
                tx.save_alert(&alert)?;
                Ok(TriageOutcome::Created(alert))
            })
        })?;

        match &outcome {
            TriageOutcome::Created(a) => log::info!(
                "Triage: {} {} scored {:.2} -> {}",
                a.alert_type,
                &a.alert_id[..12],
                a.score,
                a.state
            ),
            TriageOutcome::Merged(a) => log::debug!(
                "Triage: {} merged into {} ({} evidence)",
                a.alert_type,
                &a.alert_id[..12],
                a.evidence.len()
            ),
        }
        Ok(outcome)
    }

    /// Record the delivery result for a Delivered alert.
    pub fn record_delivery(
        &self,
        alert_id: &str,
        attempts: u32,
        delivered: bool,
    ) -> Result<Alert, PipelineError> {
        self.memory
            .with_writer(|db| {
                db.with_transaction(|tx| {
                    let Some(mut alert) = tx.get_alert(alert_id)? else {
                        return Ok(None);
                    };
                    alert.delivery_attempts = alert.delivery_attempts.saturating_add(attempts);
                    alert.undelivered = !delivered;
                    tx.save_alert(&alert)?;
                    Ok(Some(alert))
                })
            })?
            .ok_or_else(|| PipelineError::NotFound(format!("alert {}", alert_id)))
    }

    /// Append feedback and move the alert to its resolved state.
    pub fn record_feedback(
        &self,
        alert_id: &str,
        action: FeedbackAction,
        now: DateTime<Utc>,
    ) -> Result<Alert, PipelineError> {
        let target = action.target_state();
        let result = self.memory.with_writer(|db| {
            db.with_transaction(|tx| {
                let Some(mut alert) = tx.get_alert(alert_id)? else {
                    return Ok(Err(PipelineError::NotFound(format!("alert {}", alert_id))));
                };
                if !alert.state.can_transition_to(target) {
                    return Ok(Err(PipelineError::InvalidTransition {
                        alert_id: alert_id.to_string(),
                        from: alert.state.to_string(),
                        to: target.to_string(),
                    }));
                }
                tx.append_feedback(alert_id, action, &now)?;
                alert.state = target;
                alert.resolved_at = Some(now);
                tx.save_alert(&alert)?;
                Ok(Ok(alert))
            })
        })??;
        log::info!("Triage: feedback {} on {}", action.as_str(), alert_id);
        Ok(result)
    }

    /// Record `Ignored` for delivered alerts nobody reacted to in time.
    pub fn sweep_implicit_ignores(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let before = now - chrono::Duration::hours(self.config.feedback_timeout_hours);
        let stale = self
            .memory
            .with_reader(|db| db.delivered_without_feedback(&before))?;

        let mut swept = 0;
        for id in stale {
            match self.record_feedback(&id, FeedbackAction::Ignored, now) {
                Ok(_) => swept += 1,
                // Resolved concurrently.
                Err(PipelineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if swept > 0 {
            log::info!("Triage: marked {} alerts as ignored", swept);
        }
        Ok(swept)
    }

    pub fn list_alerts(
        &self,
        state: Option<AlertState>,
        limit: usize,
    ) -> Result<Vec<Alert>, PipelineError> {
        Ok(self.memory.with_reader(|db| db.list_alerts(state, limit))?)
    }

    /// Alerts created within the last `hours`, any state, newest first.
    pub fn recent_alerts(
        &self,
        hours: i64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>, PipelineError> {
        let since = now - chrono::Duration::hours(hours.max(0));
        Ok(self.memory.with_reader(|db| db.alerts_since(&since, limit))?)
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{test_triage, test_triage_with};
    use super::*;
    use crate::proactive::detectors::UNSAVED_DOCUMENT;
    use crate::proactive::AlertPriority;
    use chrono::{Duration, TimeZone};

    fn monday_10am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    fn unsaved_candidate(at: DateTime<Utc>) -> CandidateAlert {
        let mut c = CandidateAlert::new(UNSAVED_DOCUMENT, UNSAVED_DOCUMENT, at);
        c.evidence = ["meeting-1".to_string(), "doc-1".to_string()]
            .into_iter()
            .collect();
        c.raw_confidence = 0.9;
        c.priority = AlertPriority::High;
        c.subject = Some("meeting-1".to_string());
        c.title = "Unsaved work before Board sync".to_string();
        c
    }

    #[test]
    fn test_bootstrap_score_equals_prior() {
        let triage = test_triage();
        let now = monday_10am();
        let c = unsaved_candidate(now);
        let features = rules::features(&c, triage.config(), now);
        let prior = rules::rule_prior(&c, triage.config(), now);
        assert_eq!(triage.score(&c, &features, now), prior);
    }

    #[test]
    fn test_unsaved_document_delivered_at_prior() {
        let triage = test_triage();
        let now = monday_10am();
        let outcome = triage.process(&unsaved_candidate(now), now).expect("process");
        let alert = outcome.to_deliver().expect("delivered");
        assert_eq!(alert.state, AlertState::Delivered);
        assert!((alert.score - 0.8).abs() < 1e-12);
        assert_eq!(alert.delivered_at, Some(now));
    }

    #[test]
    fn test_outside_working_hours_suppressed() {
        let triage = test_triage();
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();
        let outcome = triage
            .process(&unsaved_candidate(sunday), sunday)
            .expect("process");
        assert_eq!(outcome.alert().state, AlertState::Suppressed);
        assert_eq!(outcome.alert().score, 0.0);
        assert!(outcome.to_deliver().is_none());
    }

    struct EagerModel;

    impl TriageModel for EagerModel {
        fn score(&self, _features: &[f64]) -> f64 {
            1.0
        }
        fn training_size(&self) -> usize {
            1_000_000
        }
        fn kind(&self) -> &'static str {
            "eager"
        }
    }

    #[test]
    fn test_learned_model_cannot_lift_off_hours_alert() {
        let config = Config {
            learned_weight_cap: 1.0,
            min_alert_confidence: 0.5,
            ..Config::default()
        };
        let triage = test_triage_with(config);
        triage.swap_model(Arc::new(EagerModel));
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();

        let outcome = triage
            .process(&unsaved_candidate(sunday), sunday)
            .expect("process");
        assert_eq!(outcome.alert().state, AlertState::Suppressed);
        assert_eq!(outcome.alert().score, 0.0);

        // Urgent candidates pass the gate and the model counts.
        let mut urgent = unsaved_candidate(sunday);
        urgent.subject = Some("meeting-2".to_string());
        urgent.urgent = true;
        let outcome = triage.process(&urgent, sunday).expect("process");
        assert_eq!(outcome.alert().state, AlertState::Delivered);
        assert!(outcome.alert().score > 0.9);
    }

    #[test]
    fn test_repeat_within_cooldown_merges() {
        let triage = test_triage();
        let now = monday_10am();
        let first = triage.process(&unsaved_candidate(now), now).expect("first");

        let later = now + Duration::minutes(20);
        let mut repeat = unsaved_candidate(later);
        repeat.evidence.insert("doc-2".to_string());
        repeat.raw_confidence = 0.95;
        let second = triage.process(&repeat, later).expect("second");

        assert!(matches!(second, TriageOutcome::Merged(_)));
        assert!(second.to_deliver().is_none());
        assert_eq!(second.alert().alert_id, first.alert().alert_id);
        assert_eq!(second.alert().evidence.len(), 3);
        assert_eq!(second.alert().raw_confidence, 0.95);

        let delivered = triage
            .list_alerts(Some(AlertState::Delivered), 10)
            .expect("list");
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn test_resolved_alert_absorbs_repeats_until_cooldown_ends() {
        let triage = test_triage();
        let now = monday_10am();
        let first = triage.process(&unsaved_candidate(now), now).expect("first");
        let id = first.alert().alert_id.clone();
        triage
            .record_feedback(&id, FeedbackAction::Dismissed, now + Duration::minutes(5))
            .expect("dismiss");

        let soon = now + Duration::minutes(30);
        let repeat = triage.process(&unsaved_candidate(soon), soon).expect("repeat");
        assert!(matches!(repeat, TriageOutcome::Merged(_)));

        let later = now + Duration::minutes(90);
        let fresh = triage.process(&unsaved_candidate(later), later).expect("fresh");
        assert!(matches!(fresh, TriageOutcome::Created(_)));
        assert_ne!(fresh.alert().alert_id, id);
    }

    #[test]
    fn test_feedback_transitions() {
        let triage = test_triage();
        let now = monday_10am();
        let created = triage.process(&unsaved_candidate(now), now).expect("process");
        let id = created.alert().alert_id.clone();

        let actioned = triage
            .record_feedback(&id, FeedbackAction::Actioned, now)
            .expect("feedback");
        assert_eq!(actioned.state, AlertState::Actioned);
        assert_eq!(actioned.resolved_at, Some(now));

        let again = triage.record_feedback(&id, FeedbackAction::Dismissed, now);
        assert!(matches!(again, Err(PipelineError::InvalidTransition { .. })));
        let missing = triage.record_feedback("nope", FeedbackAction::Actioned, now);
        assert!(matches!(missing, Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_sweep_marks_stale_deliveries_ignored() {
        let triage = test_triage();
        let now = monday_10am();
        let created = triage.process(&unsaved_candidate(now), now).expect("process");

        assert_eq!(triage.sweep_implicit_ignores(now + Duration::hours(1)).expect("sweep"), 0);
        assert_eq!(triage.sweep_implicit_ignores(now + Duration::hours(25)).expect("sweep"), 1);

        let alerts = triage.list_alerts(Some(AlertState::Dismissed), 10).expect("list");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_id, created.alert().alert_id);
    }

    #[test]
    fn test_recent_alerts_by_age() {
        let triage = test_triage();
        let now = monday_10am();
        let early = now - Duration::hours(30);
        triage.process(&unsaved_candidate(early), early).expect("early");
        let mut other = unsaved_candidate(now);
        other.subject = Some("meeting-2".to_string());
        let fresh = triage.process(&other, now).expect("fresh");

        let recent = triage.recent_alerts(24, now, 10).expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].alert_id, fresh.alert().alert_id);
        assert_eq!(triage.recent_alerts(48, now, 10).expect("recent").len(), 2);
    }

    #[test]
    fn test_record_delivery_failure_keeps_delivered() {
        let triage = test_triage();
        let now = monday_10am();
        let created = triage.process(&unsaved_candidate(now), now).expect("process");
        let alert = triage
            .record_delivery(&created.alert().alert_id, 3, false)
            .expect("record");
        assert_eq!(alert.state, AlertState::Delivered);
        assert!(alert.undelivered);
        assert_eq!(alert.delivery_attempts, 3);
    }
}
