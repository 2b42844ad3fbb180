//! Pure escalation transition function
//!
//! Tier per level:
//! - 1: nothing
//! - 2: alert + primary caregiver + durable follow-up; the agency is
//!   notified if the alert is still unresolved when the follow-up fires
//! - 3: alert + agency, caregiver bypassed
//!
//! Notifications only follow an alert the ledger actually inserted, so
//! re-evaluating a turn is a no-op.

use super::{Effect, Event, NotifyTarget, RiskLevel};
use crate::db::FollowUpStatus;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

const GUARDIAN_TITLE: &str = "어머니 상태 주의 필요";
const EMERGENCY_TITLE: &str = "🚨 응급 상황 발생";
const FOLLOW_UP_TITLE: &str = "🚨 보호자 미확인 경보 격상";

/// Inputs the transition needs besides the event
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub now: DateTime<Utc>,
    pub follow_up_window: Duration,
    pub agency_target: String,
}

impl EscalationContext {
    pub fn new(now: DateTime<Utc>, follow_up_window: Duration, agency_target: impl Into<String>) -> Self {
        Self {
            now,
            follow_up_window,
            agency_target: agency_target.into(),
        }
    }

    fn agency(&self) -> NotifyTarget {
        NotifyTarget::Agency(self.agency_target.clone())
    }
}

/// Result of a state transition
#[derive(Debug, Default)]
pub struct TransitionResult {
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Event has an empty user id")]
    MissingUser,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
///
/// Given the same context and event it always produces the same effects,
/// with no I/O.
pub fn transition(
    context: &EscalationContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    if event.user_id().is_empty() {
        return Err(TransitionError::MissingUser);
    }

    match event {
        Event::TurnInterpreted { level, .. } if !level.is_alerting() => Ok(TransitionResult::none()),

        Event::TurnInterpreted {
            turn_id,
            user_id,
            level,
            reason,
            guardian_contact,
        } => {
            let follow_up_due =
                (level == RiskLevel::Concern).then(|| context.now + context.follow_up_window);
            Ok(TransitionResult::none().with_effect(Effect::CreateAlert {
                user_id,
                turn_id,
                level,
                reason,
                guardian_contact,
                follow_up_due,
            }))
        }

        // Ledger already knew this turn: nothing new to announce
        Event::AlertRecorded { fresh: false, .. } => Ok(TransitionResult::none()),

        Event::AlertRecorded {
            alert_id,
            user_id,
            level,
            reason,
            guardian_contact,
            ..
        } => match level {
            RiskLevel::Normal => Err(TransitionError::InvalidTransition(format!(
                "alert {alert_id} recorded at level 1"
            ))),
            RiskLevel::Concern => {
                let effect = match guardian_contact.filter(|c| !c.trim().is_empty()) {
                    Some(contact) => Effect::notify(
                        alert_id,
                        NotifyTarget::Guardian(contact),
                        GUARDIAN_TITLE,
                        format!("사유: {reason}"),
                    ),
                    None => Effect::GuardianUnreachable { alert_id, user_id },
                };
                Ok(TransitionResult::none().with_effect(effect))
            }
            RiskLevel::Emergency => Ok(TransitionResult::none().with_effect(Effect::notify(
                alert_id,
                context.agency(),
                EMERGENCY_TITLE,
                format!("사용자 ID: {user_id} - {reason}"),
            ))),
        },

        Event::FollowUpDue {
            alert_id,
            resolved: true,
            ..
        } => Ok(TransitionResult::none().with_effect(Effect::CloseFollowUp {
            alert_id,
            outcome: FollowUpStatus::Aborted,
        })),

        // Delivery is best effort: the notification is only queued in memory
        // and is lost if the process dies before the dispatcher sends it
        Event::FollowUpDue {
            alert_id,
            user_id,
            reason,
            resolved: false,
        } => Ok(TransitionResult::none().with_effects([
            Effect::notify(
                alert_id,
                context.agency(),
                FOLLOW_UP_TITLE,
                format!(
                    "사용자 ID: {user_id} - {}분 동안 보호자 확인이 없었습니다. 사유: {reason}",
                    context.follow_up_window.num_minutes()
                ),
            ),
            Effect::MarkEscalated { alert_id },
            Effect::CloseFollowUp {
                alert_id,
                outcome: FollowUpStatus::Escalated,
            },
        ])),
    }
}
