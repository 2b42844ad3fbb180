//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the pipeline and the escalation engine with
//! mock implementations.

use crate::db::{
    Alert, AlertCreation, AlertFilter, AlertId, Database, DbResult, FollowUp, FollowUpStatus,
    NewAlert, NewTurn, Turn, TurnId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Append-only per-user turn log
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append an immutable turn; sequence and timestamp are assigned by the store
    async fn append_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> DbResult<Turn>;

    /// The `limit` most recent turns, oldest first
    async fn recent_turns(&self, user_id: &str, limit: usize) -> DbResult<Vec<Turn>>;

    /// Turns with `start <= timestamp < end`, oldest first
    async fn turns_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Turn>>;

    async fn find_turn_by_message_id(&self, message_id: &str) -> DbResult<Option<Turn>>;

    /// The ai turn answering a user turn
    async fn reply_for(&self, turn_id: TurnId) -> DbResult<Option<Turn>>;
}

/// Write-once alert ledger plus durable follow-ups
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Idempotent per triggering turn
    async fn create_alert(&self, alert: &NewAlert) -> DbResult<AlertCreation>;

    /// Compare-and-set resolve; `false` if it was already resolved
    async fn resolve_alert(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool>;

    async fn is_alert_resolved(&self, alert_id: AlertId) -> DbResult<bool>;

    async fn get_alert(&self, alert_id: AlertId) -> DbResult<Alert>;

    async fn list_alerts(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>>;

    async fn mark_alert_escalated(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool>;

    async fn claim_due_follow_ups(&self, now: DateTime<Utc>, limit: usize)
        -> DbResult<Vec<FollowUp>>;

    async fn complete_follow_up(&self, alert_id: AlertId, outcome: FollowUpStatus)
        -> DbResult<bool>;

    async fn interrupted_follow_ups(&self) -> DbResult<Vec<FollowUp>>;

    async fn requeue_follow_up(&self, alert_id: AlertId) -> DbResult<bool>;
}

/// Combined storage trait for convenience
pub trait Storage: ConversationStore + AlertStore {}
impl<T: ConversationStore + AlertStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn append_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> DbResult<Turn> {
        (**self).append_turn(turn, now).await
    }

    async fn recent_turns(&self, user_id: &str, limit: usize) -> DbResult<Vec<Turn>> {
        (**self).recent_turns(user_id, limit).await
    }

    async fn turns_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Turn>> {
        (**self).turns_between(user_id, start, end).await
    }

    async fn find_turn_by_message_id(&self, message_id: &str) -> DbResult<Option<Turn>> {
        (**self).find_turn_by_message_id(message_id).await
    }

    async fn reply_for(&self, turn_id: TurnId) -> DbResult<Option<Turn>> {
        (**self).reply_for(turn_id).await
    }
}

#[async_trait]
impl<T: AlertStore + ?Sized> AlertStore for Arc<T> {
    async fn create_alert(&self, alert: &NewAlert) -> DbResult<AlertCreation> {
        (**self).create_alert(alert).await
    }

    async fn resolve_alert(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        (**self).resolve_alert(alert_id, now).await
    }

    async fn is_alert_resolved(&self, alert_id: AlertId) -> DbResult<bool> {
        (**self).is_alert_resolved(alert_id).await
    }

    async fn get_alert(&self, alert_id: AlertId) -> DbResult<Alert> {
        (**self).get_alert(alert_id).await
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>> {
        (**self).list_alerts(filter).await
    }

    async fn mark_alert_escalated(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        (**self).mark_alert_escalated(alert_id, now).await
    }

    async fn claim_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> DbResult<Vec<FollowUp>> {
        (**self).claim_due_follow_ups(now, limit).await
    }

    async fn complete_follow_up(
        &self,
        alert_id: AlertId,
        outcome: FollowUpStatus,
    ) -> DbResult<bool> {
        (**self).complete_follow_up(alert_id, outcome).await
    }

    async fn interrupted_follow_ups(&self) -> DbResult<Vec<FollowUp>> {
        (**self).interrupted_follow_ups().await
    }

    async fn requeue_follow_up(&self, alert_id: AlertId) -> DbResult<bool> {
        (**self).requeue_follow_up(alert_id).await
    }
}

// ============================================================================
// Production adapter
// ============================================================================

/// [`Database`]-backed storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn append_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> DbResult<Turn> {
        self.db.append_turn(turn, now)
    }

    async fn recent_turns(&self, user_id: &str, limit: usize) -> DbResult<Vec<Turn>> {
        self.db.recent_turns(user_id, limit)
    }

    async fn turns_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Turn>> {
        self.db.turns_between(user_id, start, end)
    }

    async fn find_turn_by_message_id(&self, message_id: &str) -> DbResult<Option<Turn>> {
        self.db.find_turn_by_message_id(message_id)
    }

    async fn reply_for(&self, turn_id: TurnId) -> DbResult<Option<Turn>> {
        self.db.reply_for(turn_id)
    }
}

#[async_trait]
impl AlertStore for DatabaseStorage {
    async fn create_alert(&self, alert: &NewAlert) -> DbResult<AlertCreation> {
        self.db.create_alert(alert)
    }

    async fn resolve_alert(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        self.db.resolve_alert(alert_id, now)
    }

    async fn is_alert_resolved(&self, alert_id: AlertId) -> DbResult<bool> {
        self.db.is_alert_resolved(alert_id)
    }

    async fn get_alert(&self, alert_id: AlertId) -> DbResult<Alert> {
        self.db.get_alert(alert_id)
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>> {
        self.db.list_alerts(filter)
    }

    async fn mark_alert_escalated(&self, alert_id: AlertId, now: DateTime<Utc>) -> DbResult<bool> {
        self.db.mark_alert_escalated(alert_id, now)
    }

    async fn claim_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> DbResult<Vec<FollowUp>> {
        self.db.claim_due_follow_ups(now, limit)
    }

    async fn complete_follow_up(
        &self,
        alert_id: AlertId,
        outcome: FollowUpStatus,
    ) -> DbResult<bool> {
        self.db.complete_follow_up(alert_id, outcome)
    }

    async fn interrupted_follow_ups(&self) -> DbResult<Vec<FollowUp>> {
        self.db.interrupted_follow_ups()
    }

    async fn requeue_follow_up(&self, alert_id: AlertId) -> DbResult<bool> {
        self.db.requeue_follow_up(alert_id)
    }
}
