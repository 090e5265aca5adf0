//! Triage models and the trainer.
//!
//! The bootstrap model is neutral with a training size of zero, so until the
//! first successful retrain the score is exactly the rule prior.

use serde::{Deserialize, Serialize};

use crate::db::{DbFeedback, DbTriageModel};
use crate::error::PipelineError;
use crate::signals::fusion::{log_loss, sigmoid};

/// Learned usefulness estimate over a feature vector.
pub trait TriageModel: Send + Sync {
    fn score(&self, features: &[f64]) -> f64;
    /// Number of examples the model was trained on.
    fn training_size(&self) -> usize;
    fn kind(&self) -> &'static str;
}

/// Constant 0.5; never trained.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralModel;

impl TriageModel for NeutralModel {
    fn score(&self, _features: &[f64]) -> f64 {
        0.5
    }

    fn training_size(&self) -> usize {
        0
    }

    fn kind(&self) -> &'static str {
        "neutral"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub training_size: usize,
}

impl LogisticModel {
    pub const KIND: &'static str = "logistic";

    fn logit(&self, features: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

impl TriageModel for LogisticModel {
    fn score(&self, features: &[f64]) -> f64 {
        sigmoid(self.logit(features)).clamp(0.0, 1.0)
    }

    fn training_size(&self) -> usize {
        self.training_size
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }
}

/// Rebuild the persisted model. Unknown kinds and unreadable weights fall
/// back to neutral.
pub fn model_from_db(row: &DbTriageModel) -> Box<dyn TriageModel> {
    if row.kind == LogisticModel::KIND {
        match serde_json::from_str::<LogisticModel>(&row.weights_json) {
            Ok(model) => return Box::new(model),
            Err(e) => log::warn!(
                "Triage: model v{} has unreadable weights, using neutral: {}",
                row.version,
                e
            ),
        }
    } else {
        log::warn!("Triage: unknown model kind '{}', using neutral", row.kind);
    }
    Box::new(NeutralModel)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features: Vec<f64>,
    pub label: f64,
}

impl From<&DbFeedback> for TrainingExample {
    fn from(row: &DbFeedback) -> Self {
        Self {
            features: row.features.clone(),
            label: row.action.label(),
        }
    }
}

/// A model that passed validation, with its holdout loss.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: LogisticModel,
    pub validation_loss: f64,
    pub active_loss: f64,
}

/// Full-batch gradient descent for logistic regression. Deterministic: same
/// examples in, same weights out.
#[derive(Debug, Clone)]
pub struct ModelTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
    pub min_examples: usize,
    /// Most recent fraction of examples held out for validation.
    pub holdout_fraction: f64,
}

impl Default for ModelTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 400,
            l2: 1e-3,
            min_examples: 20,
            holdout_fraction: 0.2,
        }
    }
}

impl ModelTrainer {
    /// Train on the older examples and validate on the newest slice. The
    /// candidate must not do worse than `active` on that slice.
    ///
    /// `examples` must be ordered oldest first.
    pub fn retrain(
        &self,
        examples: &[TrainingExample],
        active: &dyn TriageModel,
    ) -> Result<TrainedModel, PipelineError> {
        if examples.len() < self.min_examples.max(2) {
            return Err(PipelineError::RetrainValidationFailed(format!(
                "{} examples, need {}",
                examples.len(),
                self.min_examples.max(2)
            )));
        }

        let holdout = ((examples.len() as f64 * self.holdout_fraction).ceil() as usize)
            .clamp(1, examples.len() - 1);
        let (train, validation) = examples.split_at(examples.len() - holdout);

        let mut model = self.fit(train);
        model.training_size = examples.len();

        let labels: Vec<f64> = validation.iter().map(|e| e.label).collect();
        let candidate: Vec<f64> = validation.iter().map(|e| model.score(&e.features)).collect();
        let current: Vec<f64> = validation.iter().map(|e| active.score(&e.features)).collect();
        let validation_loss = log_loss(&candidate, &labels);
        let active_loss = log_loss(&current, &labels);

        if !validation_loss.is_finite() || validation_loss > active_loss + 1e-9 {
            return Err(PipelineError::RetrainValidationFailed(format!(
                "holdout log-loss {:.4} is worse than active {:.4}",
                validation_loss, active_loss
            )));
        }

        Ok(TrainedModel {
            model,
            validation_loss,
            active_loss,
        })
    }

    fn fit(&self, examples: &[TrainingExample]) -> LogisticModel {
        let dims = examples.iter().map(|e| e.features.len()).max().unwrap_or(0);
        let mut model = LogisticModel {
            weights: vec![0.0; dims],
            bias: 0.0,
            training_size: examples.len(),
        };
        if examples.is_empty() {
            return model;
        }
        let n = examples.len() as f64;

        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0; dims];
            let mut grad_b = 0.0;
            for example in examples {
                let err = model.score(&example.features) - example.label;
                for (g, x) in grad_w.iter_mut().zip(&example.features) {
                    *g += err * x;
                }
                grad_b += err;
            }
            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * (g / n + self.l2 * *w);
            }
            model.bias -= self.learning_rate * grad_b / n;
        }

        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feature 0 predicts the label; feature 1 is noise.
    fn separable(n: usize) -> Vec<TrainingExample> {
        (0..n)
            .map(|i| {
                let useful = i % 2 == 0;
                TrainingExample {
                    features: vec![if useful { 1.0 } else { 0.0 }, (i % 3) as f64 / 2.0],
                    label: if useful { 1.0 } else { 0.0 },
                }
            })
            .collect()
    }

    #[test]
    fn test_neutral_model() {
        assert_eq!(NeutralModel.score(&[1.0, 2.0]), 0.5);
        assert_eq!(NeutralModel.training_size(), 0);
    }

    #[test]
    fn test_trainer_learns_separable_signal() {
        let trainer = ModelTrainer::default();
        let trained = trainer
            .retrain(&separable(40), &NeutralModel)
            .expect("should beat neutral");
        assert_eq!(trained.model.training_size, 40);
        assert!(trained.validation_loss < trained.active_loss);
        assert!(trained.model.score(&[1.0, 0.0]) > 0.8);
        assert!(trained.model.score(&[0.0, 0.0]) < 0.2);
    }

    #[test]
    fn test_trainer_is_deterministic() {
        let trainer = ModelTrainer::default();
        let a = trainer.retrain(&separable(30), &NeutralModel).expect("a");
        let b = trainer.retrain(&separable(30), &NeutralModel).expect("b");
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn test_too_few_examples_rejected() {
        let err = ModelTrainer::default()
            .retrain(&separable(5), &NeutralModel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::RetrainValidationFailed(_)));
    }

    #[test]
    fn test_worse_candidate_rejected() {
        let trainer = ModelTrainer::default();
        let perfect = trainer.retrain(&separable(40), &NeutralModel).expect("train");

        // History says the opposite of what the newest slice shows.
        let mut flipped: Vec<TrainingExample> = separable(32)
            .into_iter()
            .map(|mut e| {
                e.label = 1.0 - e.label;
                e
            })
            .collect();
        flipped.extend(separable(8));
        let err = trainer.retrain(&flipped, &perfect.model).unwrap_err();
        assert!(matches!(err, PipelineError::RetrainValidationFailed(_)));
    }

    #[test]
    fn test_model_from_db_roundtrip() {
        let model = LogisticModel {
            weights: vec![0.5, -0.25],
            bias: 0.1,
            training_size: 25,
        };
        let row = DbTriageModel {
            version: 3,
            kind: LogisticModel::KIND.to_string(),
            weights_json: serde_json::to_string(&model).expect("json"),
            training_size: 25,
            validation_loss: Some(0.3),
            created_at: "2026-10-19T10:00:00.000000Z".to_string(),
        };
        let loaded = model_from_db(&row);
        assert_eq!(loaded.kind(), "logistic");
        assert_eq!(loaded.training_size(), 25);

        let bad = DbTriageModel {
            kind: "forest".to_string(),
            ..row
        };
        assert_eq!(model_from_db(&bad).kind(), "neutral");
    }
}
