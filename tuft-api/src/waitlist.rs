use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use tuft_booking::WaitlistEntry;
use tuft_catalog::FrameSize;
use tuft_core::Caller;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct JoinWaitlistRequest {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub frame_size: Option<FrameSize>,
}

#[derive(Debug, Deserialize)]
pub struct LeaveWaitlistQuery {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub class_id: Uuid,
    pub priority: u32,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/classes/{id}/waitlist", post(join).delete(leave))
}

pub fn staff_routes() -> Router<AppState> {
    Router::new().route("/v1/staff/classes/{id}/waitlist", get(list))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/v1/admin/waitlist/{entry_id}/priority", put(reorder))
}

async fn join(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<Uuid>,
    req: Option<Json<JoinWaitlistRequest>>,
) -> Result<(StatusCode, Json<WaitlistEntry>), AppError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let user_id = req.user_id.unwrap_or(caller.user_id);
    let entry = state
        .repo
        .join_waitlist(&caller, class_id, user_id, req.frame_size, state.clock.now())
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn leave(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(class_id): Path<Uuid>,
    Query(query): Query<LeaveWaitlistQuery>,
) -> Result<Json<WaitlistEntry>, AppError> {
    let user_id = query.user_id.unwrap_or(caller.user_id);
    Ok(Json(state.repo.leave_waitlist(&caller, class_id, user_id).await?))
}

async fn list(State(state): State<AppState>, Path(class_id): Path<Uuid>) -> Result<Json<Vec<WaitlistEntry>>, AppError> {
    Ok(Json(state.repo.list_waitlist(class_id).await?))
}

async fn reorder(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<Vec<WaitlistEntry>>, AppError> {
    Ok(Json(
        state
            .repo
            .reorder_waitlist(req.class_id, entry_id, req.priority)
            .await?,
    ))
}
