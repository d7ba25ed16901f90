use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use tracing::info;
use tuft_booking::{CreditMovement, NewPackage, Package};
use tuft_core::Caller;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/me/packages", get(my_packages))
        .route("/v1/packages/{id}/movements", get(movements))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/packages", post(create_package))
        .route("/v1/admin/packages/{id}/activate", post(activate_package))
}

async fn my_packages(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Package>>, AppError> {
    Ok(Json(state.repo.list_user_packages(caller.user_id).await?))
}

async fn movements(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CreditMovement>>, AppError> {
    let package = state.repo.get_package(id).await?;
    caller.ensure_can_act_for(package.user_id, "package")?;
    Ok(Json(state.repo.list_credit_movements(id).await?))
}

async fn create_package(
    State(state): State<AppState>,
    Json(new): Json<NewPackage>,
) -> Result<(StatusCode, Json<Package>), AppError> {
    let package = state.repo.create_package(new, state.clock.now()).await?;
    info!(
        "Package {} granted to {} with {} credits ({})",
        package.id,
        package.user_id,
        package.total_credits,
        package.status.as_str()
    );
    Ok((StatusCode::CREATED, Json(package)))
}

async fn activate_package(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Package>, AppError> {
    Ok(Json(state.repo.activate_package(id, state.clock.now()).await?))
}
