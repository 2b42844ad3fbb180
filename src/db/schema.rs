//! Database schema and types

pub use crate::state_machine::state::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
///
/// The turn log is evidentiary: triggers reject any UPDATE or DELETE.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS turns (
    turn_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    sender TEXT NOT NULL CHECK (sender IN ('user', 'ai')),
    text TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    message_id TEXT UNIQUE,
    reply_to INTEGER,
    signals TEXT,

    UNIQUE (user_id, sequence_id)
);

CREATE INDEX IF NOT EXISTS idx_turns_user_time ON turns(user_id, timestamp_ms);
-- At most one answer per user turn
CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_one_reply ON turns(reply_to)
    WHERE sender = 'ai' AND reply_to IS NOT NULL;

CREATE TRIGGER IF NOT EXISTS turns_append_only_update
BEFORE UPDATE ON turns
BEGIN
    SELECT RAISE(ABORT, 'turn log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS turns_append_only_delete
BEFORE DELETE ON turns
BEGIN
    SELECT RAISE(ABORT, 'turn log is append-only');
END;

CREATE TABLE IF NOT EXISTS alerts (
    alert_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    turn_id INTEGER NOT NULL UNIQUE,
    level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 3),
    reason TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    is_resolved BOOLEAN NOT NULL DEFAULT 0,
    resolved_at_ms INTEGER,
    escalated_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_alerts_user ON alerts(user_id, created_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_open ON alerts(is_resolved, created_at_ms DESC);

CREATE TABLE IF NOT EXISTS follow_ups (
    alert_id INTEGER PRIMARY KEY,
    due_at_ms INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    fired_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_follow_ups_due ON follow_ups(status, due_at_ms);
";

/// Position of a turn in the append-only log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub i64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub i64);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "user"),
            Sender::Ai => write!(f, "ai"),
        }
    }
}

/// Risk and medication signals extracted from one exchange.
///
/// Only ever attached to `ai` turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSignals {
    pub risk_level: RiskLevel,
    pub reason: String,
    pub medication_checked: bool,
    /// `None` means the model could not tell; treated as not taken
    pub medication_taken: Option<bool>,
}

impl TurnSignals {
    /// Medication was asked about and positively confirmed
    pub fn confirms_medication(&self) -> bool {
        self.medication_checked && self.medication_taken == Some(true)
    }
}

/// A turn as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub turn_id: TurnId,
    pub user_id: String,
    pub sequence_id: i64,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<TurnId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<TurnSignals>,
}

/// A turn waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub user_id: String,
    pub sender: Sender,
    pub text: String,
    pub message_id: Option<String>,
    pub reply_to: Option<TurnId>,
    pub signals: Option<TurnSignals>,
}

impl NewTurn {
    pub fn user(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            sender: Sender::User,
            text: text.into(),
            message_id: None,
            reply_to: None,
            signals: None,
        }
    }

    pub fn ai(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            sender: Sender::Ai,
            text: text.into(),
            message_id: None,
            reply_to: None,
            signals: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub fn replying_to(mut self, turn_id: TurnId) -> Self {
        self.reply_to = Some(turn_id);
        self
    }

    #[must_use]
    pub fn with_signals(mut self, signals: TurnSignals) -> Self {
        self.signals = Some(signals);
        self
    }
}

/// Alert ledger record, as shown to human reviewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: AlertId,
    pub user_id: String,
    pub turn_id: TurnId,
    pub level: RiskLevel,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub is_resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
}

/// An alert waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub user_id: String,
    pub turn_id: TurnId,
    pub level: RiskLevel,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// When set, a durable follow-up is written alongside the alert
    pub follow_up_due: Option<DateTime<Utc>>,
}

/// Outcome of an idempotent alert create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertCreation {
    pub alert_id: AlertId,
    /// False when an alert already existed for the turn
    pub created: bool,
}

/// Lifecycle of a level-2 follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    /// Waiting for its deadline
    Pending,
    /// Claimed by a sweep; the resolved check and notification are in flight
    Firing,
    /// Deadline passed unresolved, agency notified
    Escalated,
    /// Found resolved at fire time
    Aborted,
    /// Alert resolved before the deadline
    Cancelled,
}

impl FollowUpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Firing => "firing",
            FollowUpStatus::Escalated => "escalated",
            FollowUpStatus::Aborted => "aborted",
            FollowUpStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FollowUpStatus::Escalated | FollowUpStatus::Aborted | FollowUpStatus::Cancelled
        )
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable delayed re-check of a level-2 alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub alert_id: AlertId,
    pub due_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub fired_at: Option<DateTime<Utc>>,
}

/// Filter for alert listings
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub user_id: Option<String>,
    pub unresolved_only: bool,
    pub limit: Option<usize>,
}
