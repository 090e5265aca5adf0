//! Persisted triage models and the retrain watermark.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{ts, DbError, DbRetrainState, DbTriageModel, MemoryDb};

impl MemoryDb {
    /// Store a model and make it the only active one. Returns its version.
    pub fn activate_model(
        &self,
        kind: &str,
        weights_json: &str,
        training_size: usize,
        validation_loss: Option<f64>,
        created_at: &DateTime<Utc>,
    ) -> Result<i64, DbError> {
        self.conn_ref()
            .execute("UPDATE triage_models SET active = 0 WHERE active = 1", [])?;
        self.conn_ref().execute(
            "INSERT INTO triage_models
                (kind, weights_json, training_size, validation_loss, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                kind,
                weights_json,
                training_size as i64,
                validation_loss,
                ts(created_at)
            ],
        )?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    pub fn active_model(&self) -> Result<Option<DbTriageModel>, DbError> {
        let row = self
            .conn_ref()
            .query_row(
                "SELECT version, kind, weights_json, training_size, validation_loss, created_at
                 FROM triage_models WHERE active = 1 ORDER BY version DESC LIMIT 1",
                [],
                |row| {
                    Ok(DbTriageModel {
                        version: row.get(0)?,
                        kind: row.get(1)?,
                        weights_json: row.get(2)?,
                        training_size: row.get(3)?,
                        validation_loss: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_retrain_state(&self) -> Result<DbRetrainState, DbError> {
        let state = self
            .conn_ref()
            .query_row(
                "SELECT last_retrain_at, last_feedback_rowid, last_outcome
                 FROM retrain_state WHERE id = 1",
                [],
                |row| {
                    Ok(DbRetrainState {
                        last_retrain_at: row.get(0)?,
                        last_feedback_rowid: row.get(1)?,
                        last_outcome: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    /// Record a retrain attempt, successful or not, so the trigger resets.
    pub fn record_retrain(
        &self,
        at: &DateTime<Utc>,
        feedback_rowid: i64,
        outcome: &str,
    ) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO retrain_state (id, last_retrain_at, last_feedback_rowid, last_outcome)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                last_retrain_at = excluded.last_retrain_at,
                last_feedback_rowid = excluded.last_feedback_rowid,
                last_outcome = excluded.last_outcome",
            params![ts(at), feedback_rowid, outcome],
        )?;
        Ok(())
    }
}
