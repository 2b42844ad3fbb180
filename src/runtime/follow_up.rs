//! Periodic sweep over due level-2 follow-ups

use super::executor::EscalationEngine;
use super::traits::AlertStore;
use crate::db::{DbError, FollowUpStatus};
use crate::state_machine::Effect;
use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub escalated: usize,
    pub aborted: usize,
    /// Fired with an error and put back in the queue
    pub requeued: usize,
}

/// Claims due follow-ups and hands them to the escalation engine
pub struct FollowUpSweeper<S> {
    engine: EscalationEngine<S>,
}

impl<S: AlertStore> FollowUpSweeper<S> {
    pub fn new(engine: EscalationEngine<S>) -> Self {
        Self { engine }
    }

    /// Claim and fire everything due at `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DbError> {
        let store = self.engine.store();
        let batch = self.engine.config().sweep_batch;
        let claimed = store.claim_due_follow_ups(now, batch).await?;
        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };

        for follow_up in &claimed {
            match self.engine.fire_follow_up(follow_up, now).await {
                Ok(effects) => match closing_outcome(&effects) {
                    Some(FollowUpStatus::Escalated) => report.escalated += 1,
                    Some(FollowUpStatus::Aborted) => report.aborted += 1,
                    _ => {}
                },
                Err(e) => {
                    tracing::error!(
                        alert_id = %follow_up.alert_id,
                        error = %e,
                        "Follow-up failed, requeueing"
                    );
                    if let Err(e) = store.requeue_follow_up(follow_up.alert_id).await {
                        tracing::error!(
                            alert_id = %follow_up.alert_id,
                            error = %e,
                            "Failed to requeue follow-up, left for startup recovery"
                        );
                    }
                    report.requeued += 1;
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                escalated = report.escalated,
                aborted = report.aborted,
                requeued = report.requeued,
                "Follow-up sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep on the configured interval until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.engine.config().sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.engine.config().sweep_interval.as_secs(),
            "Follow-up sweeper started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::error!(error = %e, "Follow-up sweep failed");
                    }
                }
            }
        }

        tracing::info!("Follow-up sweeper stopped");
    }
}

fn closing_outcome(effects: &[Effect]) -> Option<FollowUpStatus> {
    effects.iter().rev().find_map(|effect| match effect {
        Effect::CloseFollowUp { outcome, .. } => Some(*outcome),
        _ => None,
    })
}
