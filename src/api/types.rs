//! API request and response types

use crate::db::{Alert, Turn};
use crate::state_machine::CareState;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Query for a user's recent turns
#[derive(Debug, Default, Deserialize)]
pub struct TurnsQuery {
    pub limit: Option<usize>,
}

/// Filter for the alert review list
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertsQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub unresolved: bool,
    pub limit: Option<usize>,
}

/// Response with a user's turns, oldest first
#[derive(Debug, Serialize)]
pub struct TurnsResponse {
    pub turns: Vec<Turn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationResponse {
    pub user_id: String,
    pub confirmed_today: bool,
    /// Local calendar date the answer applies to
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub user_id: String,
    /// `safe`, `watch` or `emergency`
    pub status: &'static str,
    pub care_state: CareState,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
}

/// Result of a resolve request
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    /// `false` when the alert was already resolved
    pub changed: bool,
    pub alert: Alert,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
