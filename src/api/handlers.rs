//! HTTP request handlers

use super::types::{
    AlertsQuery, AlertsResponse, ErrorResponse, MedicationResponse, ResolveResponse,
    StatusResponse, TurnsQuery, TurnsResponse,
};
use super::AppState;
use crate::db::{Alert, AlertFilter, AlertId, DbError};
use crate::medication::local_day_bounds;
use crate::report::{daily_report, DailyReport};
use crate::runtime::{AlertStore, ChatInput, ChatReply, ConversationStore};
use crate::state_machine::project_care_state;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

const DEFAULT_TURNS_LIMIT: usize = 50;
const MAX_TURNS_LIMIT: usize = 500;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // User device
        .route("/api/chat", post(chat))
        // Caregiver views of one user
        .route("/api/users/:user_id/turns", get(list_turns))
        .route("/api/users/:user_id/medication", get(get_medication))
        .route("/api/users/:user_id/status", get(get_status))
        .route("/api/users/:user_id/report", get(get_report))
        // Alert review
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/:alert_id", get(get_alert))
        .route("/api/alerts/:alert_id/resolve", post(resolve_alert))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Chat
// ============================================================

async fn chat(
    State(state): State<AppState>,
    Json(input): Json<ChatInput>,
) -> Result<Json<ChatReply>, AppError> {
    if input.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId is required".to_string()));
    }
    if input.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }

    tracing::info!(user_id = %input.user_id, "Chat message received");
    Ok(Json(state.runtime.handle_message(input).await))
}

// ============================================================
// User views
// ============================================================

async fn list_turns(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TurnsQuery>,
) -> Result<Json<TurnsResponse>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TURNS_LIMIT)
        .clamp(1, MAX_TURNS_LIMIT);
    let turns = state.runtime.store().recent_turns(&user_id, limit).await?;
    Ok(Json(TurnsResponse { turns }))
}

async fn get_medication(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<MedicationResponse>, AppError> {
    let now = Utc::now();
    let offset = state.runtime.utc_offset();
    let confirmed_today = state
        .runtime
        .medication()
        .is_confirmed_today(&user_id, now, offset)
        .await?;

    Ok(Json(MedicationResponse {
        user_id,
        confirmed_today,
        date: local_day_bounds(now, offset).date,
    }))
}

async fn get_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let alerts = state
        .runtime
        .store()
        .list_alerts(&AlertFilter {
            user_id: Some(user_id.clone()),
            unresolved_only: true,
            limit: None,
        })
        .await?;
    let care_state = project_care_state(&alerts);

    Ok(Json(StatusResponse {
        user_id,
        status: care_state.label(),
        care_state,
    }))
}

async fn get_report(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DailyReport>, AppError> {
    let report = daily_report(
        state.runtime.store(),
        &user_id,
        Utc::now(),
        state.runtime.utc_offset(),
    )
    .await?;
    Ok(Json(report))
}

// ============================================================
// Alert review
// ============================================================

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>, AppError> {
    let filter = AlertFilter {
        user_id: query.user_id.filter(|u| !u.is_empty()),
        unresolved_only: query.unresolved,
        limit: query.limit,
    };
    let alerts = state.runtime.store().list_alerts(&filter).await?;
    Ok(Json(AlertsResponse { alerts }))
}

async fn get_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<Alert>, AppError> {
    let alert = state.runtime.store().get_alert(AlertId(alert_id)).await?;
    Ok(Json(alert))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<ResolveResponse>, AppError> {
    let alert_id = AlertId(alert_id);
    let store = state.runtime.store();
    let changed = store.resolve_alert(alert_id, Utc::now()).await?;
    if changed {
        tracing::info!(alert_id = %alert_id, "Alert resolved by reviewer");
    }
    let alert = store.get_alert(alert_id).await?;
    Ok(Json(ResolveResponse { changed, alert }))
}

async fn get_version() -> &'static str {
    concat!("gyeot ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::AlertNotFound(_) | DbError::TurnNotFound(_) => AppError::NotFound(e.to_string()),
            e => {
                tracing::error!(error = %e, "Storage error in request");
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
