//! Alert generation.
//!
//! Detectors look at the entities an ingestion batch touched and propose
//! candidate alerts. They never write and never deliver; triage decides.

pub mod detectors;
pub mod engine;

pub use engine::{
    default_generator, fingerprint, AlertGenerator, AlertPriority, CandidateAlert, DetectorFn,
    DetectorInput, GenerationReport,
};
