//! Alert records and the append-only feedback log.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, ts, DbError, MemoryDb};
use crate::proactive::AlertPriority;
use crate::triage::{Alert, AlertState, FeedbackAction};

const ALERT_COLUMNS: &str = "id, identity_key, alert_type, detector_id, evidence_json,
    raw_confidence, score, state, priority, title, message, suggested_actions_json,
    features_json, urgent, undelivered, delivery_attempts, created_at, delivered_at, resolved_at";

/// A feedback log row joined with the features its alert was scored on.
#[derive(Debug, Clone)]
pub struct DbFeedback {
    pub rowid: i64,
    pub alert_id: String,
    pub action: FeedbackAction,
    pub recorded_at: DateTime<Utc>,
    pub features: Vec<f64>,
}

struct AlertRow {
    id: String,
    identity_key: String,
    alert_type: String,
    detector_id: String,
    evidence_json: String,
    raw_confidence: f64,
    score: f64,
    state: String,
    priority: String,
    title: String,
    message: String,
    suggested_actions_json: String,
    features_json: String,
    urgent: bool,
    undelivered: bool,
    delivery_attempts: i64,
    created_at: String,
    delivered_at: Option<String>,
    resolved_at: Option<String>,
}

impl AlertRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_key: row.get(1)?,
            alert_type: row.get(2)?,
            detector_id: row.get(3)?,
            evidence_json: row.get(4)?,
            raw_confidence: row.get(5)?,
            score: row.get(6)?,
            state: row.get(7)?,
            priority: row.get(8)?,
            title: row.get(9)?,
            message: row.get(10)?,
            suggested_actions_json: row.get(11)?,
            features_json: row.get(12)?,
            urgent: row.get::<_, i64>(13)? != 0,
            undelivered: row.get::<_, i64>(14)? != 0,
            delivery_attempts: row.get(15)?,
            created_at: row.get(16)?,
            delivered_at: row.get(17)?,
            resolved_at: row.get(18)?,
        })
    }

    fn decode(self) -> Result<Alert, DbError> {
        let corrupt = |what: &str, detail: String| {
            DbError::CorruptRow(format!("alert {} {}: {}", self.id, what, detail))
        };
        let state = AlertState::parse(&self.state)
            .ok_or_else(|| corrupt("state", self.state.clone()))?;
        let priority = AlertPriority::parse(&self.priority)
            .ok_or_else(|| corrupt("priority", self.priority.clone()))?;
        let evidence: BTreeSet<String> = serde_json::from_str(&self.evidence_json)
            .map_err(|e| corrupt("evidence", e.to_string()))?;
        let suggested_actions: Vec<String> = serde_json::from_str(&self.suggested_actions_json)
            .map_err(|e| corrupt("suggested actions", e.to_string()))?;
        let features: Vec<f64> = serde_json::from_str(&self.features_json)
            .map_err(|e| corrupt("features", e.to_string()))?;
        let delivered_at = self.delivered_at.as_deref().map(parse_ts).transpose()?;
        let resolved_at = self.resolved_at.as_deref().map(parse_ts).transpose()?;

        Ok(Alert {
            created_at: parse_ts(&self.created_at)?,
            alert_id: self.id,
            identity_key: self.identity_key,
            alert_type: self.alert_type,
            detector_id: self.detector_id,
            evidence,
            raw_confidence: self.raw_confidence,
            score: self.score,
            state,
            priority,
            title: self.title,
            message: self.message,
            suggested_actions,
            features,
            urgent: self.urgent,
            undelivered: self.undelivered,
            delivery_attempts: self.delivery_attempts.max(0) as u32,
            delivered_at,
            resolved_at,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|e| DbError::CorruptRow(e.to_string()))
}

impl MemoryDb {
    /// Insert or fully replace an alert row.
    pub fn save_alert(&self, alert: &Alert) -> Result<(), DbError> {
        self.conn_ref().execute(
            "INSERT INTO alerts
                (id, identity_key, alert_type, detector_id, evidence_json, raw_confidence,
                 score, state, priority, title, message, suggested_actions_json, features_json,
                 urgent, undelivered, delivery_attempts, created_at, delivered_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(id) DO UPDATE SET
                evidence_json = excluded.evidence_json,
                raw_confidence = excluded.raw_confidence,
                score = excluded.score,
                state = excluded.state,
                priority = excluded.priority,
                title = excluded.title,
                message = excluded.message,
                suggested_actions_json = excluded.suggested_actions_json,
                features_json = excluded.features_json,
                urgent = excluded.urgent,
                undelivered = excluded.undelivered,
                delivery_attempts = excluded.delivery_attempts,
                delivered_at = excluded.delivered_at,
                resolved_at = excluded.resolved_at",
            params![
                alert.alert_id,
                alert.identity_key,
                alert.alert_type,
                alert.detector_id,
                to_json(&alert.evidence)?,
                alert.raw_confidence,
                alert.score.clamp(0.0, 1.0),
                alert.state.as_str(),
                alert.priority.as_str(),
                alert.title,
                alert.message,
                to_json(&alert.suggested_actions)?,
                to_json(&alert.features)?,
                alert.urgent as i64,
                alert.undelivered as i64,
                alert.delivery_attempts as i64,
                ts(&alert.created_at),
                alert.delivered_at.as_ref().map(ts),
                alert.resolved_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_alert(&self, id: &str) -> Result<Option<Alert>, DbError> {
        let sql = format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS);
        let row = self
            .conn_ref()
            .query_row(&sql, params![id], AlertRow::from_row)
            .optional()?;
        row.map(AlertRow::decode).transpose()
    }

    /// Most recently created alert sharing `identity_key`.
    pub fn latest_alert_by_identity(&self, identity_key: &str) -> Result<Option<Alert>, DbError> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE identity_key = ?1 ORDER BY created_at DESC, id LIMIT 1",
            ALERT_COLUMNS
        );
        let row = self
            .conn_ref()
            .query_row(&sql, params![identity_key], AlertRow::from_row)
            .optional()?;
        row.map(AlertRow::decode).transpose()
    }

    /// Alerts, newest first, optionally restricted to one state.
    pub fn list_alerts(
        &self,
        state: Option<AlertState>,
        limit: usize,
    ) -> Result<Vec<Alert>, DbError> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE (?1 IS NULL OR state = ?1)
             ORDER BY created_at DESC, id LIMIT ?2",
            ALERT_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(
            params![state.map(|s| s.as_str()), limit as i64],
            AlertRow::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Alerts created at or after `since`, newest first.
    pub fn alerts_since(
        &self,
        since: &DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>, DbError> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE created_at >= ?1
             ORDER BY created_at DESC, id LIMIT ?2",
            ALERT_COLUMNS
        );
        let mut stmt = self.conn_ref().prepare(&sql)?;
        let rows = stmt.query_map(params![ts(since), limit as i64], AlertRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Delivered alerts older than `before` that have no feedback yet.
    pub fn delivered_without_feedback(&self, before: &DateTime<Utc>) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT a.id FROM alerts a
             WHERE a.state = 'delivered' AND a.delivered_at IS NOT NULL AND a.delivered_at < ?1
               AND NOT EXISTS (SELECT 1 FROM feedback f WHERE f.alert_id = a.id)
             ORDER BY a.delivered_at",
        )?;
        let rows = stmt.query_map(params![ts(before)], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append to the feedback log. Returns the new rowid.
    pub fn append_feedback(
        &self,
        alert_id: &str,
        action: FeedbackAction,
        recorded_at: &DateTime<Utc>,
    ) -> Result<i64, DbError> {
        self.conn_ref().execute(
            "INSERT INTO feedback (alert_id, action, recorded_at) VALUES (?1, ?2, ?3)",
            params![alert_id, action.as_str(), ts(recorded_at)],
        )?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    pub fn count_feedback_since(&self, rowid: i64) -> Result<usize, DbError> {
        let n: i64 = self.conn_ref().query_row(
            "SELECT COUNT(*) FROM feedback WHERE rowid > ?1",
            params![rowid],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn max_feedback_rowid(&self) -> Result<i64, DbError> {
        let n: i64 = self.conn_ref().query_row(
            "SELECT COALESCE(MAX(rowid), 0) FROM feedback",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// The whole feedback log with alert features, oldest first.
    pub fn feedback_examples(&self) -> Result<Vec<DbFeedback>, DbError> {
        let mut stmt = self.conn_ref().prepare(
            "SELECT f.rowid, f.alert_id, f.action, f.recorded_at, a.features_json
             FROM feedback f JOIN alerts a ON a.id = f.alert_id
             ORDER BY f.recorded_at, f.rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (rowid, alert_id, action, recorded_at, features_json) = row?;
            let action = FeedbackAction::parse(&action).ok_or_else(|| {
                DbError::CorruptRow(format!("feedback {}: unknown action {}", rowid, action))
            })?;
            let features: Vec<f64> = serde_json::from_str(&features_json)
                .map_err(|e| DbError::CorruptRow(format!("feedback {}: {}", rowid, e)))?;
            out.push(DbFeedback {
                rowid,
                alert_id,
                action,
                recorded_at: parse_ts(&recorded_at)?,
                features,
            });
        }
        Ok(out)
    }
}
