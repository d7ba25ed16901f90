use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tracing::info;
use tuft_booking::{
    BookRequest, BookingOutcome, CancelActor, CancellationOutcome, RescheduleOutcome, Reservation,
};
use tuft_catalog::FrameSize;
use tuft_core::{notify::dispatch_all, Caller};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BookSeatRequest {
    /// Staff may book on behalf of a student; defaults to the caller.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub frame_size: Option<FrameSize>,
    /// Credit package to debit; omit for pay-later.
    #[serde(default)]
    pub package_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelReservationRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub target_class_id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/classes/{id}/reservations", post(book_seat))
        .route("/v1/me/reservations", get(my_reservations))
        .route("/v1/reservations/{id}", get(get_reservation))
        .route("/v1/reservations/{id}/cancel", post(cancel_reservation))
        .route("/v1/reservations/{id}/reschedule", post(reschedule))
}

pub fn staff_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/staff/reservations/{id}/check-in", post(check_in))
        .route("/v1/staff/reservations/{id}/no-show", post(mark_no_show))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/v1/admin/reservations/{id}/payment", post(record_payment))
}

async fn book_seat(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<Uuid>,
    req: Option<Json<BookSeatRequest>>,
) -> Result<(StatusCode, Json<BookingOutcome>), AppError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let request = BookRequest {
        class_id,
        user_id: req.user_id.unwrap_or(caller.user_id),
        frame_size: req.frame_size,
        package_id: req.package_id,
    };
    let outcome = state.repo.book(&caller, &request, state.clock.now()).await?;
    info!(
        "Reservation {} confirmed for user {} in class {}",
        outcome.reservation.id, request.user_id, class_id
    );
    dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn my_reservations(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Reservation>>, AppError> {
    Ok(Json(state.repo.list_user_reservations(caller.user_id).await?))
}

async fn get_reservation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = state.repo.get_reservation(id).await?;
    caller.ensure_can_act_for(reservation.user_id, "reservation")?;
    Ok(Json(reservation))
}

async fn cancel_reservation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    req: Option<Json<CancelReservationRequest>>,
) -> Result<Json<CancellationOutcome>, AppError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let outcome = state
        .repo
        .cancel_reservation(&CancelActor::Caller(caller), id, req.reason, state.clock.now())
        .await?;
    if let Some(promotion) = &outcome.promoted {
        info!(
            "Seat from reservation {} went to waitlisted user {}",
            id, promotion.reservation.user_id
        );
    }
    dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
    Ok(Json(outcome))
}

async fn reschedule(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<RescheduleOutcome>, AppError> {
    let outcome = state
        .repo
        .reschedule(&caller, id, req.target_class_id, state.clock.now())
        .await?;
    dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
    Ok(Json(outcome))
}

async fn check_in(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.repo.check_in(id, state.clock.now()).await?))
}

async fn mark_no_show(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.repo.mark_no_show(id, state.clock.now()).await?))
}

async fn record_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Reservation>, AppError> {
    let reservation = state.repo.record_payment(id, state.clock.now()).await?;
    info!("Payment recorded for reservation {}", id);
    Ok(Json(reservation))
}
