use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode},
    middleware::{from_fn, from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod classes;
pub mod error;
pub mod middleware;
pub mod packages;
pub mod reservations;
pub mod schedule;
pub mod state;
pub mod waitlist;
pub mod worker;

pub use error::AppError;
pub use state::{AppState, AuthConfig};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let staff = Router::new()
        .merge(classes::staff_routes())
        .merge(reservations::staff_routes())
        .merge(waitlist::staff_routes())
        .route_layer(from_fn(crate::middleware::require_staff));

    let admin = Router::new()
        .merge(classes::admin_routes())
        .merge(reservations::admin_routes())
        .merge(waitlist::admin_routes())
        .merge(packages::admin_routes())
        .merge(schedule::admin_routes())
        .route_layer(from_fn(crate::middleware::require_admin));

    // Role gates run inside `authenticate`, which installs the caller.
    let authenticated = Router::new()
        .merge(classes::routes())
        .merge(reservations::routes())
        .merge(waitlist::routes())
        .merge(packages::routes())
        .merge(staff)
        .merge(admin)
        .route_layer(from_fn_with_state(
            state.clone(),
            crate::middleware::authenticate,
        ));

    let router = Router::new()
        .route("/health", get(health))
        .merge(authenticated);

    let router = if state.redis.is_some() {
        router.layer(from_fn_with_state(state.clone(), rate_limit_middleware))
    } else {
        router
    };

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let Some(redis) = &state.redis else {
        return next.run(req).await;
    };
    let key = format!("ratelimit:{}", addr.ip());

    match redis.check_rate_limit(&key, state.requests_per_minute, 60).await {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Err(e) => {
            tracing::warn!("Rate limiter unavailable: {}", e);
            next.run(req).await // Fail open
        }
    }
}
