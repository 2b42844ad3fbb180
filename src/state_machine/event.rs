//! Events that drive escalation decisions

use crate::db::{AlertId, TurnId};
use crate::state_machine::state::RiskLevel;

/// Inputs to [`transition`](super::transition)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An ai turn with signals was stored for a user turn
    TurnInterpreted {
        turn_id: TurnId,
        user_id: String,
        level: RiskLevel,
        reason: String,
        guardian_contact: Option<String>,
    },

    /// The alert ledger answered a create request.
    ///
    /// `fresh` is false when the ledger already held an alert for the turn.
    AlertRecorded {
        alert_id: AlertId,
        turn_id: TurnId,
        user_id: String,
        level: RiskLevel,
        reason: String,
        guardian_contact: Option<String>,
        fresh: bool,
    },

    /// A level-2 follow-up reached its deadline and was claimed
    FollowUpDue {
        alert_id: AlertId,
        user_id: String,
        reason: String,
        resolved: bool,
    },
}

impl Event {
    pub fn user_id(&self) -> &str {
        match self {
            Event::TurnInterpreted { user_id, .. }
            | Event::AlertRecorded { user_id, .. }
            | Event::FollowUpDue { user_id, .. } => user_id,
        }
    }
}
