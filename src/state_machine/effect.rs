//! Effects produced by state transitions

use crate::db::{AlertId, FollowUpStatus, TurnId};
use crate::state_machine::state::RiskLevel;
use chrono::{DateTime, Utc};
use std::fmt;

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotifyTarget {
    /// Primary caregiver, addressed by contact
    Guardian(String),
    /// Fixed agency tier
    Agency(String),
}

impl NotifyTarget {
    pub fn address(&self) -> &str {
        match self {
            NotifyTarget::Guardian(a) | NotifyTarget::Agency(a) => a,
        }
    }

    pub fn is_agency(&self) -> bool {
        matches!(self, NotifyTarget::Agency(_))
    }
}

impl fmt::Display for NotifyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyTarget::Guardian(a) => write!(f, "guardian:{a}"),
            NotifyTarget::Agency(a) => write!(f, "agency:{a}"),
        }
    }
}

/// Effects to be executed after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write-once alert keyed by the triggering turn, with an optional follow-up.
    /// The executor answers with [`Event::AlertRecorded`](super::Event::AlertRecorded).
    CreateAlert {
        user_id: String,
        turn_id: TurnId,
        level: RiskLevel,
        reason: String,
        guardian_contact: Option<String>,
        follow_up_due: Option<DateTime<Utc>>,
    },

    /// Enqueue a push notification on the outbox
    Notify {
        alert_id: AlertId,
        target: NotifyTarget,
        title: String,
        body: String,
    },

    /// A level-2 alert has no guardian to notify
    GuardianUnreachable { alert_id: AlertId, user_id: String },

    /// Record the agency escalation on the alert
    MarkEscalated { alert_id: AlertId },

    /// Move a claimed follow-up to its final status
    CloseFollowUp {
        alert_id: AlertId,
        outcome: FollowUpStatus,
    },
}

impl Effect {
    pub fn notify(
        alert_id: AlertId,
        target: NotifyTarget,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Effect::Notify {
            alert_id,
            target,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn is_notify(&self) -> bool {
        matches!(self, Effect::Notify { .. })
    }
}
