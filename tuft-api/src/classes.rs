use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;
use tuft_booking::{CapacityChangeOutcome, ClassCancellationOutcome, ClassView, CompletionOutcome};
use tuft_catalog::{Class, FrameSize, NewClass};
use tuft_core::{notify::dispatch_all, Caller};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Default listing horizon when `to` is omitted.
const DEFAULT_LISTING_DAYS: i64 = 14;

#[derive(Debug, Deserialize)]
pub struct ListClassesQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCapacityRequest {
    pub capacity: u32,
    #[serde(default)]
    pub frame_capacity: Option<BTreeMap<FrameSize, u32>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelClassRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/classes", get(list_classes))
        .route("/v1/classes/{id}", get(get_class))
}

pub fn staff_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/staff/classes/{id}/start", post(start_class))
        .route("/v1/staff/classes/{id}/complete", post(complete_class))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/classes", post(create_class))
        .route("/v1/admin/classes/{id}/capacity", put(update_capacity))
        .route("/v1/admin/classes/{id}/cancel", post(cancel_class))
}

async fn list_classes(
    State(state): State<AppState>,
    Query(query): Query<ListClassesQuery>,
) -> Result<Json<Vec<Class>>, AppError> {
    let from = query.from.unwrap_or_else(|| state.clock.now());
    let to = query.to.unwrap_or(from + Duration::days(DEFAULT_LISTING_DAYS));
    Ok(Json(state.repo.list_classes(from, to).await?))
}

async fn get_class(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ClassView>, AppError> {
    Ok(Json(state.repo.get_class(id).await?))
}

async fn start_class(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Class>, AppError> {
    let class = state.repo.start_class(id, state.clock.now()).await?;
    info!("Class {} started", id);
    Ok(Json(class))
}

async fn complete_class(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CompletionOutcome>, AppError> {
    let outcome = state.repo.complete_class(id, state.clock.now()).await?;
    info!(
        "Class {} completed: {} completed, {} unresolved",
        id,
        outcome.completed.len(),
        outcome.unresolved.len()
    );
    Ok(Json(outcome))
}

async fn create_class(
    State(state): State<AppState>,
    Json(new): Json<NewClass>,
) -> Result<(StatusCode, Json<Class>), AppError> {
    let class = state.repo.create_class(new, state.clock.now()).await?;
    Ok((StatusCode::CREATED, Json(class)))
}

async fn update_capacity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCapacityRequest>,
) -> Result<Json<CapacityChangeOutcome>, AppError> {
    let outcome = state
        .repo
        .update_capacity(id, req.capacity, req.frame_capacity, state.clock.now())
        .await?;
    dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
    Ok(Json(outcome))
}

async fn cancel_class(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelClassRequest>,
) -> Result<Json<ClassCancellationOutcome>, AppError> {
    let outcome = state.repo.cancel_class(id, req.reason, state.clock.now()).await?;
    info!(
        "Class {} cancelled by {}: {} reservations, {} waitlisted",
        id,
        caller.user_id,
        outcome.cancelled.len(),
        outcome.waitlist_cleared
    );
    dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
    Ok(Json(outcome))
}
