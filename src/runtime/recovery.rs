//! Follow-up recovery logic
//!
//! A crash between claiming a follow-up and closing it leaves the row in
//! `firing`. At startup each such row is either closed from what the alert
//! ledger already shows or put back in the queue.

use super::traits::AlertStore;
use crate::db::{Alert, DbError, FollowUp, FollowUpStatus};

/// What to do with an interrupted follow-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub follow_up: FollowUp,
    /// Final status to record, or `None` to requeue
    pub close_as: Option<FollowUpStatus>,
    /// Reason for the decision (for debugging)
    pub reason: RecoveryReason,
}

/// Why we made a particular recovery decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The agency was already notified before the interruption
    AlreadyEscalated,
    /// A reviewer resolved the alert, nothing left to escalate
    AlertResolved,
    /// The alert row is gone
    AlertMissing,
    /// Neither escalated nor resolved: fire again on the next sweep
    Interrupted,
}

/// Decide how to recover one follow-up from its alert
pub fn decide_recovery(follow_up: &FollowUp, alert: Option<&Alert>) -> RecoveryDecision {
    let (close_as, reason) = match alert {
        None => (Some(FollowUpStatus::Aborted), RecoveryReason::AlertMissing),
        Some(a) if a.escalated_at.is_some() => (
            Some(FollowUpStatus::Escalated),
            RecoveryReason::AlreadyEscalated,
        ),
        Some(a) if a.is_resolved => (Some(FollowUpStatus::Aborted), RecoveryReason::AlertResolved),
        Some(_) => (None, RecoveryReason::Interrupted),
    };
    RecoveryDecision {
        follow_up: follow_up.clone(),
        close_as,
        reason,
    }
}

/// Recover every follow-up left in `firing`
pub async fn recover_follow_ups<S: AlertStore>(store: &S) -> Result<Vec<RecoveryDecision>, DbError> {
    let interrupted = store.interrupted_follow_ups().await?;
    let mut decisions = Vec::with_capacity(interrupted.len());

    for follow_up in interrupted {
        let alert = match store.get_alert(follow_up.alert_id).await {
            Ok(alert) => Some(alert),
            Err(DbError::AlertNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let decision = decide_recovery(&follow_up, alert.as_ref());

        match decision.close_as {
            Some(outcome) => {
                store.complete_follow_up(follow_up.alert_id, outcome).await?;
            }
            None => {
                store.requeue_follow_up(follow_up.alert_id).await?;
            }
        }
        tracing::info!(
            alert_id = %follow_up.alert_id,
            reason = ?decision.reason,
            "Recovered interrupted follow-up"
        );
        decisions.push(decision);
    }

    Ok(decisions)
}
