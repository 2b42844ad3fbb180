//! Risk levels and the derived per-user care state

use crate::db::{Alert, AlertId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Risk ordinal assigned by the interpreter to each AI turn.
///
/// Closed set: anything outside `1..=3` is rejected at the boundary with
/// [`InvalidRiskLevel`] rather than clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RiskLevel {
    /// 1: ordinary conversation
    Normal,
    /// 2: low mood, lethargy, anything a caregiver should look at
    Concern,
    /// 3: accident or emergency
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("risk level {0} is outside 1..=3")]
pub struct InvalidRiskLevel(pub i64);

impl RiskLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            RiskLevel::Normal => 1,
            RiskLevel::Concern => 2,
            RiskLevel::Emergency => 3,
        }
    }

    /// Whether a turn at this level produces an alert at all
    pub fn is_alerting(self) -> bool {
        self > RiskLevel::Normal
    }
}

impl TryFrom<i64> for RiskLevel {
    type Error = InvalidRiskLevel;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RiskLevel::Normal),
            2 => Ok(RiskLevel::Concern),
            3 => Ok(RiskLevel::Emergency),
            other => Err(InvalidRiskLevel(other)),
        }
    }
}

impl From<RiskLevel> for i64 {
    fn from(level: RiskLevel) -> Self {
        level.as_i64()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Per-user care state.
///
/// Never stored. Always recomputed from the alert ledger by
/// [`project_care_state`] so it cannot drift from the records it summarizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CareState {
    #[default]
    Normal,
    /// An unresolved level-2 alert is waiting for the caregiver
    Watch {
        #[serde(rename = "alertId")]
        alert_id: AlertId,
    },
    /// An unresolved level-3 alert, or a level-2 alert already escalated to the agency
    Emergency {
        #[serde(rename = "alertId")]
        alert_id: AlertId,
    },
}

impl CareState {
    /// Short label used by the dashboard and the daily report
    pub fn label(&self) -> &'static str {
        match self {
            CareState::Normal => "safe",
            CareState::Watch { .. } => "watch",
            CareState::Emergency { .. } => "emergency",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            CareState::Normal => 0,
            CareState::Watch { .. } => 1,
            CareState::Emergency { .. } => 2,
        }
    }
}

/// Fold a user's alerts into their current care state.
///
/// Resolved alerts are ignored. The most severe open alert wins; between
/// equally severe alerts the most recent one is reported.
pub fn project_care_state<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> CareState {
    alerts
        .into_iter()
        .filter(|alert| !alert.is_resolved)
        .fold(
            (CareState::Normal, None),
            |(current, newest), alert| {
                let candidate = match alert.level {
                    RiskLevel::Normal => CareState::Normal,
                    RiskLevel::Concern if alert.escalated_at.is_some() => CareState::Emergency {
                        alert_id: alert.alert_id,
                    },
                    RiskLevel::Concern => CareState::Watch {
                        alert_id: alert.alert_id,
                    },
                    RiskLevel::Emergency => CareState::Emergency {
                        alert_id: alert.alert_id,
                    },
                };
                let newer = newest.map_or(true, |t| alert.created_at >= t);
                if candidate.severity() > current.severity()
                    || (candidate.severity() == current.severity()
                        && candidate.severity() > 0
                        && newer)
                {
                    (candidate, Some(alert.created_at))
                } else {
                    (current, newest)
                }
            },
        )
        .0
}
