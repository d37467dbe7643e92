// libs/appointment-cell/src/handlers.rs
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Duration;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::{Role, User};
use shared_models::error::AppError;

use crate::models::{
    Actor, AppointmentError, AvailableSlotsQuery, AvailableSlotsRangeQuery, CancelAppointmentRequest, ChangeStateRequest,
    CreateAppointmentRequest, OccupiedRangesQuery, RejectionReason, UpdateAppointmentRequest,
};
use crate::router::AppointmentCellState;

const DEFAULT_OCCUPIED_RANGE_DAYS: i64 = 7;

impl From<AppointmentError> for AppError {
    fn from(err: AppointmentError) -> Self {
        let code = err.code().to_string();
        let message = err.to_string();
        match err {
            AppointmentError::Rejected(RejectionReason::SlotConflict) => AppError::Conflict {
                code,
                message,
                retryable: false,
            },
            AppointmentError::Rejected(RejectionReason::BarberNotFound | RejectionReason::ClientNotFound)
            | AppointmentError::NotFound(_) => AppError::NotFound { code, message },
            AppointmentError::Rejected(_) => AppError::Rejected { code, message },
            AppointmentError::Forbidden(_) => AppError::Forbidden { code, message },
            AppointmentError::ConcurrentBooking | AppointmentError::ConcurrentModification => AppError::Conflict {
                code,
                message,
                retryable: true,
            },
            AppointmentError::Storage(msg) => AppError::Internal(msg),
        }
    }
}

// ==============================================================================
// AUTHENTICATED HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<AppointmentCellState>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = Actor::from(&user);
    let appointment = state.booking.create_appointment(request, &actor).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment booked successfully"
        })),
    ))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(state): State<AppointmentCellState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointments = state.booking.list_appointments(&Actor::from(&user)).await?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<AppointmentCellState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state
        .booking
        .get_appointment(appointment_id, &Actor::from(&user))
        .await?;

    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn update_appointment(
    State(state): State<AppointmentCellState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state
        .booking
        .update_appointment(appointment_id, request, &Actor::from(&user))
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment updated successfully"
    })))
}

#[axum::debug_handler]
pub async fn delete_appointment(
    State(state): State<AppointmentCellState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    state
        .booking
        .delete_appointment(appointment_id, &Actor::from(&user))
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Appointment deleted"
    })))
}

#[axum::debug_handler]
pub async fn change_appointment_state(
    State(state): State<AppointmentCellState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<ChangeStateRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state
        .booking
        .change_state(appointment_id, request.state, &Actor::from(&user), request.note)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": format!("Appointment is now {}", appointment.state)
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<AppointmentCellState>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let appointment = state
        .booking
        .cancel_own_appointment(appointment_id, user.id, request.note)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled successfully"
    })))
}

/// Admin only.
#[axum::debug_handler]
pub async fn sweep_appointments(
    State(state): State<AppointmentCellState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if user.role != Role::Admin {
        return Err(AppointmentError::Forbidden(RejectionReason::RoleNotPermitted).into());
    }

    let report = state.booking.sweep_expired(state.booking.now()).await?;
    Ok(Json(json!(report)))
}

// ==============================================================================
// PUBLIC HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_available_slots(
    State(state): State<AppointmentCellState>,
    Query(query): Query<AvailableSlotsQuery>,
) -> Result<Json<Value>, AppError> {
    let slots = state
        .booking
        .list_available_slots(query.barber_id, query.date)
        .await?;

    Ok(Json(json!({
        "barber_id": query.barber_id,
        "date": query.date,
        "slots": slots
    })))
}

#[axum::debug_handler]
pub async fn get_available_slots_range(
    State(state): State<AppointmentCellState>,
    Query(query): Query<AvailableSlotsRangeQuery>,
) -> Result<Json<Value>, AppError> {
    let slots = state
        .booking
        .list_available_slots_range(query.barber_id, query.from, query.to)
        .await?;

    Ok(Json(json!({
        "barber_id": query.barber_id,
        "from": query.from,
        "to": query.to,
        "total": slots.len(),
        "slots": slots
    })))
}

#[axum::debug_handler]
pub async fn get_occupied_ranges(
    State(state): State<AppointmentCellState>,
    Query(query): Query<OccupiedRangesQuery>,
) -> Result<Json<Value>, AppError> {
    let from = query.from.unwrap_or_else(|| state.booking.now());
    let to = query
        .to
        .unwrap_or_else(|| from + Duration::days(DEFAULT_OCCUPIED_RANGE_DAYS));

    if from > to {
        return Err(AppError::BadRequest("'from' must not be after 'to'".to_string()));
    }

    let ranges = state
        .booking
        .list_occupied_ranges(query.barber_id, from, to)
        .await?;

    Ok(Json(json!({
        "barber_id": query.barber_id,
        "from": from,
        "to": to,
        "occupied": ranges
    })))
}
