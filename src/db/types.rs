//! Shared type definitions for the database layer.

use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// A stored row could not be decoded (bad enum tag, bad JSON, bad blob).
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl DbError {
    /// True when the store itself is unreadable, as opposed to a failed query.
    pub fn is_corruption(&self) -> bool {
        match self {
            DbError::Migration(_) | DbError::CorruptRow(_) => true,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

/// Per-source watermark row from `source_cursors`.
#[derive(Debug, Clone, PartialEq)]
pub struct DbSourceCursor {
    pub source_id: String,
    pub cursor: String,
    pub updated_at: String,
}

/// Row from `retrain_state` (singleton, id = 1).
#[derive(Debug, Clone, Default)]
pub struct DbRetrainState {
    pub last_retrain_at: Option<String>,
    pub last_feedback_rowid: i64,
    pub last_outcome: Option<String>,
}

/// Row from `triage_models`.
#[derive(Debug, Clone)]
pub struct DbTriageModel {
    pub version: i64,
    pub kind: String,
    pub weights_json: String,
    pub training_size: i64,
    pub validation_loss: Option<f64>,
    pub created_at: String,
}
