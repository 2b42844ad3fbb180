//! Database module for the companion backend
//!
//! Provides persistence for the per-user turn log, the alert ledger and
//! durable follow-ups.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Alert not found: {0}")]
    AlertNotFound(AlertId),
    #[error("Turn not found: {0}")]
    TurnNotFound(TurnId),
    #[error("Invalid turn: {0}")]
    InvalidTurn(String),
    #[error("Invalid alert: {0}")]
    InvalidAlert(String),
    #[error("Message already stored: {0}")]
    DuplicateMessage(String),
    #[error("Turn {0} already has a reply")]
    DuplicateReply(TurnId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

const TURN_COLUMNS: &str =
    "turn_id, user_id, sequence_id, sender, text, timestamp_ms, message_id, reply_to, signals";

const ALERT_COLUMNS: &str = "alert_id, user_id, turn_id, level, reason, created_at_ms, \
     is_resolved, resolved_at_ms, escalated_at_ms";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Turn Operations ====================

    /// Append a turn to the user's log.
    ///
    /// The sequence id and timestamp are assigned inside one transaction:
    /// `sequence_id = last + 1` and `timestamp = max(now, last timestamp)`,
    /// so a user's log stays totally ordered even under concurrent writers.
    pub fn append_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> DbResult<Turn> {
        if turn.sender == Sender::User && turn.signals.is_some() {
            return Err(DbError::InvalidTurn(
                "user turns never carry signals".to_string(),
            ));
        }
        if turn.user_id.is_empty() {
            return Err(DbError::InvalidTurn("empty user id".to_string()));
        }

        let signals_json = turn
            .signals
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let last: Option<(i64, i64)> = tx
            .query_row(
                "SELECT sequence_id, timestamp_ms FROM turns
                 WHERE user_id = ?1 ORDER BY sequence_id DESC LIMIT 1",
                params![turn.user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (sequence_id, timestamp_ms) = match last {
            Some((seq, ts)) => (seq + 1, now.timestamp_millis().max(ts)),
            None => (1, now.timestamp_millis()),
        };

        let inserted = tx.execute(
            "INSERT INTO turns (user_id, sequence_id, sender, text, timestamp_ms, message_id, reply_to, signals)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                turn.user_id,
                sequence_id,
                turn.sender.to_string(),
                turn.text,
                timestamp_ms,
                turn.message_id,
                turn.reply_to.map(|t| t.0),
                signals_json,
            ],
        );
        if let Err(e) = inserted {
            if !is_unique_violation(&e) {
                return Err(e.into());
            }
            return Err(match (&turn.message_id, turn.reply_to) {
                (Some(message_id), _) => DbError::DuplicateMessage(message_id.clone()),
                (None, Some(answered)) => DbError::DuplicateReply(answered),
                (None, None) => e.into(),
            });
        }
        let turn_id = TurnId(tx.last_insert_rowid());
        tx.commit()?;

        Ok(Turn {
            turn_id,
            user_id: turn.user_id.clone(),
            sequence_id,
            sender: turn.sender,
            text: turn.text.clone(),
            timestamp: from_millis(timestamp_ms),
            message_id: turn.message_id.clone(),
            reply_to: turn.reply_to,
            signals: turn.signals.clone(),
        })
    }

    pub fn get_turn(&self, turn_id: TurnId) -> DbResult<Turn> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TURN_COLUMNS} FROM turns WHERE turn_id = ?1"),
            params![turn_id.0],
            map_turn,
        )
        .optional()?
        .ok_or(DbError::TurnNotFound(turn_id))
    }

    /// The `limit` most recent turns for a user, oldest first
    pub fn recent_turns(&self, user_id: &str, limit: usize) -> DbResult<Vec<Turn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM turns WHERE user_id = ?1
             ORDER BY sequence_id DESC LIMIT ?2"
        ))?;
        let mut turns = stmt
            .query_map(params![user_id, sql_limit(Some(limit))], map_turn)?
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// Turns with `start <= timestamp < end`, oldest first
    pub fn turns_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Turn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM turns
             WHERE user_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
             ORDER BY sequence_id ASC"
        ))?;
        let turns = stmt
            .query_map(
                params![user_id, start.timestamp_millis(), end.timestamp_millis()],
                map_turn,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    pub fn find_turn_by_message_id(&self, message_id: &str) -> DbResult<Option<Turn>> {
        let conn = self.conn()?;
        let turn = conn
            .query_row(
                &format!("SELECT {TURN_COLUMNS} FROM turns WHERE message_id = ?1"),
                params![message_id],
                map_turn,
            )
            .optional()?;
        Ok(turn)
    }

    /// The ai turn answering the given user turn, if one was stored
    pub fn reply_for(&self, turn_id: TurnId) -> DbResult<Option<Turn>> {
        let conn = self.conn()?;
        let turn = conn
            .query_row(
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns
                     WHERE reply_to = ?1 AND sender = 'ai'
                     ORDER BY sequence_id ASC LIMIT 1"
                ),
                params![turn_id.0],
                map_turn,
            )
            .optional()?;
        Ok(turn)
    }

    // ==================== Alert Operations ====================

    /// Write an alert unless one already exists for the triggering turn.
    ///
    /// A follow-up row is written in the same transaction when
    /// `follow_up_due` is set and the alert is new.
    pub fn create_alert(&self, alert: &NewAlert) -> DbResult<AlertCreation> {
        if !alert.level.is_alerting() {
            return Err(DbError::InvalidAlert(format!(
                "level {} does not raise alerts",
                alert.level
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "INSERT INTO alerts (user_id, turn_id, level, reason, created_at_ms, is_resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(turn_id) DO NOTHING",
            params![
                alert.user_id,
                alert.turn_id.0,
                alert.level.as_i64(),
                alert.reason,
                alert.created_at.timestamp_millis(),
            ],
        )?;

        let creation = if changed == 1 {
            let alert_id = AlertId(tx.last_insert_rowid());
            if let Some(due) = alert.follow_up_due {
                tx.execute(
                    "INSERT INTO follow_ups (alert_id, due_at_ms, status) VALUES (?1, ?2, 'pending')",
                    params![alert_id.0, due.timestamp_millis()],
                )?;
            }
            AlertCreation {
                alert_id,
                created: true,
            }
        } else {
            let existing: i64 = tx.query_row(
                "SELECT alert_id FROM alerts WHERE turn_id = ?1",
                params![alert.turn_id.0],
                |row| row.get(0),
            )?;
            AlertCreation {
                alert_id: AlertId(existing),
                created: false,
            }
        };

        tx.commit()?;
        Ok(creation)
    }

    pub fn get_alert(&self, alert_id: AlertId) -> DbResult<Alert> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE alert_id = ?1"),
            params![alert_id.0],
            map_alert,
        )
        .optional()?
        .ok_or(DbError::AlertNotFound(alert_id))
    }

    pub fn alert_for_turn(&self, turn_id: TurnId) -> DbResult<Option<Alert>> {
        let conn = self.conn()?;
        let alert = conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE turn_id = ?1"),
                params![turn_id.0],
                map_alert,
            )
            .optional()?;
        Ok(alert)
    }

    /// Alerts matching the filter, newest first
    pub fn list_alerts(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 = 0 OR is_resolved = 0)
             ORDER BY created_at_ms DESC, alert_id DESC
             LIMIT ?3"
        ))?;
        let alerts = stmt
            .query_map(
                params![
                    filter.user_id,
                    filter.unresolved_only,
                    sql_limit(filter.limit)
                ],
                map_alert,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    /// Mark an alert resolved.
    ///
    /// Compare-and-set: returns `false` when it was already resolved. A
    /// still-pending follow-up is cancelled in the same transaction.
    pub fn resolve_alert(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT alert_id FROM alerts WHERE alert_id = ?1",
                params![alert_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DbError::AlertNotFound(alert_id));
        }

        let changed = tx.execute(
            "UPDATE alerts SET is_resolved = 1, resolved_at_ms = ?1
             WHERE alert_id = ?2 AND is_resolved = 0",
            params![now.timestamp_millis(), alert_id.0],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE follow_ups SET status = 'cancelled'
                 WHERE alert_id = ?1 AND status = 'pending'",
                params![alert_id.0],
            )?;
        }

        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn is_alert_resolved(&self, alert_id: AlertId) -> DbResult<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT is_resolved FROM alerts WHERE alert_id = ?1",
            params![alert_id.0],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(DbError::AlertNotFound(alert_id))
    }

    /// Record that the alert was escalated to the agency tier. Set once.
    pub fn mark_alert_escalated(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE alerts SET escalated_at_ms = ?1
             WHERE alert_id = ?2 AND escalated_at_ms IS NULL",
            params![now.timestamp_millis(), alert_id.0],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT alert_id FROM alerts WHERE alert_id = ?1",
                    params![alert_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(DbError::AlertNotFound(alert_id));
            }
        }
        Ok(changed == 1)
    }

    // ==================== Follow-up Operations ====================

    pub fn get_follow_up(&self, alert_id: AlertId) -> DbResult<Option<FollowUp>> {
        let conn = self.conn()?;
        let follow_up = conn
            .query_row(
                "SELECT alert_id, due_at_ms, status, fired_at_ms FROM follow_ups WHERE alert_id = ?1",
                params![alert_id.0],
                map_follow_up,
            )
            .optional()?;
        Ok(follow_up)
    }

    /// Claim pending follow-ups whose deadline has passed.
    ///
    /// Each row moves `pending -> firing` with a compare-and-set, so a row is
    /// handed to at most one caller.
    pub fn claim_due_follow_ups(&self, now: DateTime<Utc>, limit: usize) -> DbResult<Vec<FollowUp>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let due: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT alert_id, due_at_ms FROM follow_ups
                 WHERE status = 'pending' AND due_at_ms <= ?1
                 ORDER BY due_at_ms ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![now.timestamp_millis(), sql_limit(Some(limit))],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(due.len());
        for (alert_id, due_at_ms) in due {
            let changed = tx.execute(
                "UPDATE follow_ups SET status = 'firing', fired_at_ms = ?1
                 WHERE alert_id = ?2 AND status = 'pending'",
                params![now.timestamp_millis(), alert_id],
            )?;
            if changed == 1 {
                claimed.push(FollowUp {
                    alert_id: AlertId(alert_id),
                    due_at: from_millis(due_at_ms),
                    status: FollowUpStatus::Firing,
                    fired_at: Some(now),
                });
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Close a claimed follow-up. Only rows in `firing` move.
    pub fn complete_follow_up(&self, alert_id: AlertId, outcome: FollowUpStatus) -> DbResult<bool> {
        if !outcome.is_terminal() {
            return Err(DbError::InvalidAlert(format!(
                "follow-up cannot complete as {outcome}"
            )));
        }
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE follow_ups SET status = ?1 WHERE alert_id = ?2 AND status = 'firing'",
            params![outcome.as_str(), alert_id.0],
        )?;
        Ok(changed == 1)
    }

    /// Follow-ups left in `firing` by an interrupted sweep
    pub fn interrupted_follow_ups(&self) -> DbResult<Vec<FollowUp>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT alert_id, due_at_ms, status, fired_at_ms FROM follow_ups
             WHERE status = 'firing' ORDER BY due_at_ms ASC",
        )?;
        let rows = stmt
            .query_map([], map_follow_up)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Put an interrupted follow-up back in the queue
    pub fn requeue_follow_up(&self, alert_id: AlertId) -> DbResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE follow_ups SET status = 'pending', fired_at_ms = NULL
             WHERE alert_id = ?1 AND status = 'firing'",
            params![alert_id.0],
        )?;
        Ok(changed == 1)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// SQLite treats a negative LIMIT as unbounded
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn parse_sender(s: &str) -> Option<Sender> {
    match s {
        "user" => Some(Sender::User),
        "ai" => Some(Sender::Ai),
        _ => None,
    }
}

fn parse_follow_up_status(s: &str) -> Option<FollowUpStatus> {
    match s {
        "pending" => Some(FollowUpStatus::Pending),
        "firing" => Some(FollowUpStatus::Firing),
        "escalated" => Some(FollowUpStatus::Escalated),
        "aborted" => Some(FollowUpStatus::Aborted),
        "cancelled" => Some(FollowUpStatus::Cancelled),
        _ => None,
    }
}

fn map_turn(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let sender: String = row.get(3)?;
    let sender = parse_sender(&sender).ok_or_else(|| {
        conversion_error(3, Type::Text, DbError::InvalidTurn(format!("sender {sender}")))
    })?;
    let signals = row
        .get::<_, Option<String>>(8)?
        .map(|json| serde_json::from_str::<TurnSignals>(&json))
        .transpose()
        .map_err(|e| conversion_error(8, Type::Text, e))?;

    Ok(Turn {
        turn_id: TurnId(row.get(0)?),
        user_id: row.get(1)?,
        sequence_id: row.get(2)?,
        sender,
        text: row.get(4)?,
        timestamp: from_millis(row.get(5)?),
        message_id: row.get(6)?,
        reply_to: row.get::<_, Option<i64>>(7)?.map(TurnId),
        signals,
    })
}

fn map_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let level = RiskLevel::try_from(row.get::<_, i64>(3)?)
        .map_err(|e| conversion_error(3, Type::Integer, e))?;
    Ok(Alert {
        alert_id: AlertId(row.get(0)?),
        user_id: row.get(1)?,
        turn_id: TurnId(row.get(2)?),
        level,
        reason: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        is_resolved: row.get(6)?,
        resolved_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        escalated_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
    })
}

fn map_follow_up(row: &Row<'_>) -> rusqlite::Result<FollowUp> {
    let status: String = row.get(2)?;
    let status = parse_follow_up_status(&status).ok_or_else(|| {
        conversion_error(2, Type::Text, DbError::InvalidAlert(format!("status {status}")))
    })?;
    Ok(FollowUp {
        alert_id: AlertId(row.get(0)?),
        due_at: from_millis(row.get(1)?),
        status,
        fired_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
    })
}
