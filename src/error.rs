//! Error types for the ingestion → triage pipeline
//!
//! Errors are classified by how the pipeline reacts to them:
//! - Retryable: source outages, timeouts, embedding and delivery failures
//! - Skippable: malformed payloads (logged, the batch continues)
//! - Fatal: an unreadable or corrupt store, surfaced to the operator

use thiserror::Error;

use crate::db::DbError;

/// Error taxonomy shared by every pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    // Retryable errors
    #[error("Source {source_id} unavailable: {message}")]
    TransientSource { source_id: String, message: String },

    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Delivery of alert {alert_id} failed: {message}")]
    DeliveryFailed { alert_id: String, message: String },

    // Skippable errors
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Retrain rejected by validation: {0}")]
    RetrainValidationFailed(String),

    #[error("Alert {alert_id} cannot move from {from} to {to}")]
    InvalidTransition {
        alert_id: String,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // Fatal errors
    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl PipelineError {
    /// Returns true if the failed operation may succeed when retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientSource { .. }
                | PipelineError::Timeout { .. }
                | PipelineError::EmbeddingUnavailable(_)
                | PipelineError::DeliveryFailed { .. }
        )
    }

    /// Returns true if the error means persisted state can no longer be trusted.
    ///
    /// Only these stop the daemon; everything else degrades gracefully.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Store(db) => db.is_corruption(),
            _ => false,
        }
    }

    pub fn timeout(operation: &str, secs: u64) -> Self {
        PipelineError::Timeout {
            operation: operation.to_string(),
            secs,
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Store(DbError::Sqlite(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::timeout("poll", 30).is_retryable());
        assert!(PipelineError::TransientSource {
            source_id: "mail".to_string(),
            message: "429".to_string(),
        }
        .is_retryable());
        assert!(!PipelineError::MalformedPayload("no title".to_string()).is_retryable());
        assert!(!PipelineError::RetrainValidationFailed("worse".to_string()).is_retryable());
    }

    #[test]
    fn test_only_corruption_is_fatal() {
        assert!(PipelineError::Store(DbError::Migration("bad".to_string())).is_fatal());
        assert!(PipelineError::Store(DbError::CorruptRow("x".to_string())).is_fatal());
        assert!(!PipelineError::NotFound("alert".to_string()).is_fatal());
        assert!(!PipelineError::Store(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
            .is_fatal());
    }
}
