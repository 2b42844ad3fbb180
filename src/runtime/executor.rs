//! Escalation executor
//!
//! Runs the pure transition function and performs its effects. An effect
//! may answer with a follow-on event (alert create -> `AlertRecorded`),
//! which is processed in the same loop until no events remain.

use super::traits::AlertStore;
use crate::config::EscalationConfig;
use crate::db::{DbError, FollowUp, NewAlert, TurnId, TurnSignals};
use crate::notify::{Notification, Outbox};
use crate::state_machine::{transition, Effect, EscalationContext, Event, TransitionError};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),
    #[error("Alert store failed: {0}")]
    Storage(#[from] DbError),
}

/// Decides and performs escalations for interpreted turns and due follow-ups
#[derive(Clone)]
pub struct EscalationEngine<S> {
    store: S,
    outbox: Outbox,
    config: EscalationConfig,
}

impl<S: AlertStore> EscalationEngine<S> {
    pub fn new(store: S, outbox: Outbox, config: EscalationConfig) -> Self {
        Self {
            store,
            outbox,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Evaluate the signals of a stored ai turn.
    ///
    /// `turn_id` is the alert idempotency key. Calling this twice for the
    /// same turn performs the alert create again but produces no new
    /// notification. Returns the effects that were performed.
    pub async fn evaluate(
        &self,
        turn_id: TurnId,
        user_id: &str,
        signals: &TurnSignals,
        guardian_contact: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, EscalationError> {
        self.run(
            Event::TurnInterpreted {
                turn_id,
                user_id: user_id.to_string(),
                level: signals.risk_level,
                reason: signals.reason.clone(),
                guardian_contact: guardian_contact.map(String::from),
            },
            now,
        )
        .await
    }

    /// Fire a claimed follow-up: escalate to the agency unless the alert
    /// was resolved in the meantime
    pub async fn fire_follow_up(
        &self,
        follow_up: &FollowUp,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, EscalationError> {
        let alert = self.store.get_alert(follow_up.alert_id).await?;
        self.run(
            Event::FollowUpDue {
                alert_id: alert.alert_id,
                user_id: alert.user_id,
                reason: alert.reason,
                resolved: alert.is_resolved,
            },
            now,
        )
        .await
    }

    async fn run(&self, event: Event, now: DateTime<Utc>) -> Result<Vec<Effect>, EscalationError> {
        let context = EscalationContext::new(
            now,
            self.config.follow_up_window,
            self.config.agency_target.clone(),
        );
        let mut events = VecDeque::from([event]);
        let mut performed = Vec::new();

        while let Some(event) = events.pop_front() {
            let result = transition(&context, event)?;
            for effect in result.effects {
                if let Some(next) = self.execute_effect(&effect, now).await? {
                    events.push_back(next);
                }
                performed.push(effect);
            }
        }

        Ok(performed)
    }

    async fn execute_effect(
        &self,
        effect: &Effect,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>, EscalationError> {
        match effect {
            Effect::CreateAlert {
                user_id,
                turn_id,
                level,
                reason,
                guardian_contact,
                follow_up_due,
            } => {
                let creation = self
                    .store
                    .create_alert(&NewAlert {
                        user_id: user_id.clone(),
                        turn_id: *turn_id,
                        level: *level,
                        reason: reason.clone(),
                        created_at: now,
                        follow_up_due: *follow_up_due,
                    })
                    .await?;
                if creation.created {
                    tracing::info!(
                        user_id = %user_id,
                        alert_id = %creation.alert_id,
                        turn_id = %turn_id,
                        level = %level,
                        "Alert recorded"
                    );
                } else {
                    tracing::debug!(
                        alert_id = %creation.alert_id,
                        turn_id = %turn_id,
                        "Alert already recorded for turn"
                    );
                }
                Ok(Some(Event::AlertRecorded {
                    alert_id: creation.alert_id,
                    turn_id: *turn_id,
                    user_id: user_id.clone(),
                    level: *level,
                    reason: reason.clone(),
                    guardian_contact: guardian_contact.clone(),
                    fresh: creation.created,
                }))
            }

            Effect::Notify {
                alert_id,
                target,
                title,
                body,
            } => {
                let queued = self.outbox.enqueue(Notification {
                    alert_id: *alert_id,
                    target: target.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    enqueued_at: now,
                });
                match queued {
                    Ok(()) => tracing::info!(alert_id = %alert_id, to = %target, "Notification queued"),
                    Err(e) => tracing::error!(
                        alert_id = %alert_id,
                        to = %target,
                        error = %e,
                        "Failed to queue notification, alert left for review"
                    ),
                }
                Ok(None)
            }

            Effect::GuardianUnreachable { alert_id, user_id } => {
                tracing::warn!(
                    user_id = %user_id,
                    alert_id = %alert_id,
                    "No guardian contact for level-2 alert, relying on follow-up"
                );
                Ok(None)
            }

            Effect::MarkEscalated { alert_id } => {
                if !self.store.mark_alert_escalated(*alert_id, now).await? {
                    tracing::debug!(alert_id = %alert_id, "Alert already marked escalated");
                }
                Ok(None)
            }

            Effect::CloseFollowUp { alert_id, outcome } => {
                if self.store.complete_follow_up(*alert_id, *outcome).await? {
                    tracing::info!(alert_id = %alert_id, outcome = %outcome, "Follow-up closed");
                } else {
                    tracing::warn!(alert_id = %alert_id, outcome = %outcome, "Follow-up was not in firing state");
                }
                Ok(None)
            }
        }
    }
}
