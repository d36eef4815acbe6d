// libs/agenda-cell/src/handlers.rs
use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::debug;

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::require_staff;

use crate::models::{
    AgendaError, BookSlotRequest, BookingError, BulkGenerateRequest, CancelSlotRequest,
    PatientIdentity, SlotId, SyncRangeRequest, ToggleSlotRequest,
};
use crate::router::AgendaState;

impl From<AgendaError> for AppError {
    fn from(err: AgendaError) -> Self {
        match err {
            AgendaError::SlotBooked(_) => AppError::Conflict(err.to_string()),
            AgendaError::AgendaNotConfigured(_) => AppError::NotFound(err.to_string()),
            AgendaError::Storage(msg) => AppError::Database(msg),
            AgendaError::InvalidDuration(_)
            | AgendaError::InvalidTime(_)
            | AgendaError::InvalidRange { .. }
            | AgendaError::InvalidDateRange { .. } => AppError::ValidationError(err.to_string()),
        }
    }
}

impl From<BookingError> for AppError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::SlotTaken => AppError::Conflict(err.code().to_string()),
            BookingError::InvalidPatient(msg) => AppError::ValidationError(msg),
            BookingError::InvalidSlot(id) => AppError::NotFound(format!("Slot {} not found", id)),
            BookingError::Technical(_) => AppError::Internal(err.code().to_string()),
        }
    }
}

// ==============================================================================
// AGENDA EDITING HANDLERS
// ==============================================================================

pub async fn get_day_view(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path((professional_id, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let view = state.agenda.day_view(&user.id, &professional_id, date).await?;
    Ok(Json(json!(view)))
}

pub async fn toggle_slot(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path((professional_id, date)): Path<(String, NaiveDate)>,
    Json(request): Json<ToggleSlotRequest>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let (outcome, view) = state
        .agenda
        .toggle(&user.id, &professional_id, date, &request.time)
        .await?;
    debug!("Toggle {} on {} {}: {:?}", request.time, professional_id, date, outcome);

    Ok(Json(json!(view)))
}

pub async fn commit_pending(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path((professional_id, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let summary = state.agenda.commit_pending(&user.id, &professional_id, date).await?;
    Ok(Json(json!(summary)))
}

pub async fn discard_pending(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path((professional_id, date)): Path<(String, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    state.agenda.discard_pending(&user.id, &professional_id, date).await;
    Ok(Json(json!({ "discarded": true })))
}

pub async fn bulk_generate(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path(professional_id): Path<String>,
    Json(request): Json<BulkGenerateRequest>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let summary = state.agenda.bulk_generate(&professional_id, &request).await?;
    Ok(Json(json!(summary)))
}

pub async fn sync_range(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path(professional_id): Path<String>,
    Json(request): Json<SyncRangeRequest>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let summary = state.agenda.sync_range(&professional_id, &request).await?;
    Ok(Json(json!(summary)))
}

// ==============================================================================
// BOOKING HANDLERS
// ==============================================================================

pub async fn book_slot(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path(slot_id): Path<String>,
    Json(request): Json<BookSlotRequest>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let patient = PatientIdentity {
        name: request.patient_name,
        rut: request.patient_rut,
        phone: request.patient_phone,
    };
    let slot = state.booking.book(&SlotId::from(slot_id), &patient).await?;

    Ok(Json(json!({ "success": true, "slot": slot })))
}

pub async fn cancel_slot(
    State(state): State<AgendaState>,
    Extension(user): Extension<User>,
    Path(slot_id): Path<String>,
    request: Option<Json<CancelSlotRequest>>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;

    let request = request.map(|Json(body)| body).unwrap_or_default();
    let released = state
        .booking
        .cancel_and_notify(&SlotId::from(slot_id), request.notify)
        .await?;

    Ok(Json(json!({
        "success": true,
        "cancelled": released.is_some(),
    })))
}
