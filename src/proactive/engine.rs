//! Alert generation engine.
//!
//! Manages a registry of independent detectors and runs them over the
//! entities touched by an ingestion batch. A failing or panicking detector is
//! logged and skipped; the others still run.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entity::{ContextEntity, Relationship};
use crate::memory::MemoryView;
use crate::types::Config;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Low => "low",
            AlertPriority::Medium => "medium",
            AlertPriority::High => "high",
            AlertPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(AlertPriority::Low),
            "medium" => Some(AlertPriority::Medium),
            "high" => Some(AlertPriority::High),
            "critical" => Some(AlertPriority::Critical),
            _ => None,
        }
    }

    /// Numeric form used as a triage feature.
    pub fn weight(&self) -> f64 {
        match self {
            AlertPriority::Low => 0.25,
            AlertPriority::Medium => 0.5,
            AlertPriority::High => 0.75,
            AlertPriority::Critical => 1.0,
        }
    }
}

/// A detector's proposal. Transient: triage turns it into an `Alert`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAlert {
    pub detector_id: String,
    pub alert_type: String,
    pub evidence: BTreeSet<String>,
    pub raw_confidence: f64,
    pub generated_at: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub priority: AlertPriority,
    pub suggested_actions: Vec<String>,
    /// Bypasses the working-hours gate.
    pub urgent: bool,
    /// Stable subject for identity (e.g. a meeting id or project name).
    /// Without one, identity falls back to the evidence set.
    pub subject: Option<String>,
}

impl CandidateAlert {
    pub fn new(detector_id: &str, alert_type: &str, generated_at: DateTime<Utc>) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            alert_type: alert_type.to_string(),
            evidence: BTreeSet::new(),
            raw_confidence: 0.5,
            generated_at,
            title: String::new(),
            message: String::new(),
            priority: AlertPriority::Medium,
            suggested_actions: Vec::new(),
            urgent: false,
            subject: None,
        }
    }
}

/// Everything a detector may look at. Detectors never write.
pub struct DetectorInput<'a> {
    /// Entities touched by the batch, as persisted.
    pub entities: &'a [ContextEntity],
    /// Edges touching those entities.
    pub relationships: &'a [Relationship],
    pub memory: &'a dyn MemoryView,
    pub now: DateTime<Utc>,
    pub config: &'a Config,
}

/// Function signature for a detector.
pub type DetectorFn = fn(&DetectorInput<'_>) -> Result<Vec<CandidateAlert>, String>;

pub struct DetectorEntry {
    pub name: String,
    pub detector: DetectorFn,
}

#[derive(Debug, Default)]
pub struct GenerationReport {
    pub candidates: Vec<CandidateAlert>,
    pub detectors_run: usize,
    /// `(detector, error)` for each detector that failed or panicked.
    pub failures: Vec<(String, String)>,
}

#[derive(Default)]
pub struct AlertGenerator {
    detectors: Vec<DetectorEntry>,
}

impl AlertGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, detector: DetectorFn) {
        self.detectors.push(DetectorEntry {
            name: name.to_string(),
            detector,
        });
    }

    pub fn names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Run every enabled detector once.
    pub fn run(&self, input: &DetectorInput<'_>) -> GenerationReport {
        let mut report = GenerationReport::default();

        for entry in &self.detectors {
            if !input.config.detectors.is_enabled(&entry.name) {
                continue;
            }
            report.detectors_run += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.detector)(input)));
            match outcome {
                Ok(Ok(candidates)) => {
                    if !candidates.is_empty() {
                        log::debug!(
                            "Generator: {} produced {} candidates",
                            entry.name,
                            candidates.len()
                        );
                    }
                    report.candidates.extend(candidates);
                }
                Ok(Err(e)) => {
                    log::warn!("Generator: detector {} failed: {}", entry.name, e);
                    report.failures.push((entry.name.clone(), e));
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    log::error!("Generator: detector {} panicked: {}", entry.name, message);
                    report.failures.push((entry.name.clone(), message));
                }
            }
        }

        report
    }
}

/// Build a generator with every built-in detector registered.
pub fn default_generator() -> AlertGenerator {
    use super::detectors;

    let mut generator = AlertGenerator::new();
    generator.register(
        detectors::UNSAVED_DOCUMENT,
        detectors::detect_unsaved_document_before_meeting,
    );
    generator.register(detectors::UNTRACKED_PROJECT, detectors::detect_untracked_project);
    generator.register(detectors::SCHEDULE_CONFLICT, detectors::detect_schedule_conflict);
    generator.register(detectors::COMMUNICATION_LOAD, detectors::detect_communication_load);
    generator.register(detectors::MEETING_FOLLOW_UP, detectors::detect_meeting_follow_up);
    generator.register(detectors::MEETING_REMINDER, detectors::detect_meeting_reminder);
    generator
}

/// Compute a stable hex digest from key components.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
