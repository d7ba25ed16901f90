use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::Deserialize;
use std::collections::BTreeMap;
use tuft_catalog::{FrameSize, GenerateRequest, GenerationOutcome, Holiday, RecurringClassPattern};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreatePatternRequest {
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    #[serde(default)]
    pub instructor_id: Option<Uuid>,
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub capacity: u32,
    #[serde(default)]
    pub frame_capacity: BTreeMap<FrameSize, u32>,
    #[serde(default)]
    pub price_cents: i64,
    pub valid_from: NaiveDate,
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
}

impl From<CreatePatternRequest> for RecurringClassPattern {
    fn from(req: CreatePatternRequest) -> Self {
        RecurringClassPattern {
            id: Uuid::new_v4(),
            class_type_id: req.class_type_id,
            title: req.title,
            location: req.location,
            instructor_id: req.instructor_id,
            day_of_week: req.day_of_week,
            start_time: req.start_time,
            duration_minutes: req.duration_minutes,
            capacity: req.capacity,
            frame_capacity: req.frame_capacity,
            price_cents: req.price_cents,
            valid_from: req.valid_from,
            valid_until: req.valid_until,
            is_active: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateHolidayRequest {
    pub date: NaiveDate,
    pub name: String,
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/patterns", post(create_pattern).get(list_patterns))
        .route("/v1/admin/patterns/{id}/generate", post(generate))
        .route("/v1/admin/holidays", post(add_holiday).get(list_holidays))
}

async fn create_pattern(
    State(state): State<AppState>,
    Json(req): Json<CreatePatternRequest>,
) -> Result<(StatusCode, Json<RecurringClassPattern>), AppError> {
    let pattern = state.repo.create_pattern(req.into()).await?;
    Ok((StatusCode::CREATED, Json(pattern)))
}

async fn list_patterns(State(state): State<AppState>) -> Result<Json<Vec<RecurringClassPattern>>, AppError> {
    Ok(Json(state.repo.list_patterns().await?))
}

async fn generate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerationOutcome>, AppError> {
    Ok(Json(state.repo.generate_classes(id, &req, state.clock.now()).await?))
}

async fn add_holiday(
    State(state): State<AppState>,
    Json(req): Json<CreateHolidayRequest>,
) -> Result<(StatusCode, Json<Holiday>), AppError> {
    let holiday = state.repo.add_holiday(Holiday::new(req.date, req.name)).await?;
    Ok((StatusCode::CREATED, Json(holiday)))
}

async fn list_holidays(State(state): State<AppState>) -> Result<Json<Vec<Holiday>>, AppError> {
    Ok(Json(state.repo.list_holidays().await?))
}
