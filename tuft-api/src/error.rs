use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tuft_core::StudioError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Studio(#[from] StudioError),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn status_of(err: &StudioError) -> StatusCode {
    match err {
        StudioError::NotFound { .. } => StatusCode::NOT_FOUND,
        StudioError::AlreadyExists { .. }
        | StudioError::CapacityExceeded { .. }
        | StudioError::InvalidStateTransition { .. }
        | StudioError::NotInProgress(_)
        | StudioError::Conflict(_) => StatusCode::CONFLICT,
        StudioError::InsufficientCredits { .. }
        | StudioError::PackageClassTypeMismatch { .. }
        | StudioError::CancellationWindowViolation { .. }
        | StudioError::NoCheckedInStudents(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StudioError::Unauthorized(_) => StatusCode::FORBIDDEN,
        StudioError::ValidationError(_) => StatusCode::BAD_REQUEST,
        StudioError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Structured context a client can act on without parsing the message.
fn details_of(err: &StudioError) -> Value {
    match err {
        StudioError::CapacityExceeded {
            capacity,
            active,
            frame_size,
        } => json!({ "capacity": capacity, "active": active, "frame_size": frame_size }),
        StudioError::InsufficientCredits {
            package_id,
            used_credits,
            total_credits,
            status,
        } => json!({
            "package_id": package_id,
            "used_credits": used_credits,
            "total_credits": total_credits,
            "status": status,
        }),
        StudioError::PackageClassTypeMismatch {
            package_id,
            package_class_type,
            target_class_type,
        } => json!({
            "package_id": package_id,
            "package_class_type": package_class_type,
            "target_class_type": target_class_type,
        }),
        StudioError::CancellationWindowViolation {
            minutes_remaining,
            required_hours,
        } => json!({ "minutes_remaining": minutes_remaining, "required_hours": required_hours }),
        StudioError::InvalidStateTransition { entity, from, to } => {
            json!({ "entity": entity, "from": from, "to": to })
        }
        _ => Value::Null,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message, details) = match &self {
            AppError::Studio(StudioError::Storage(msg)) => {
                tracing::error!("Storage failure: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Internal Server Error".to_string(),
                    Value::Null,
                )
            }
            AppError::Studio(err) => {
                if matches!(err, StudioError::Conflict(_)) {
                    tracing::warn!("Gave up after repeated conflicts: {}", err);
                }
                (status_of(err), err.kind(), err.to_string(), details_of(err))
            }
            AppError::Authentication(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg.clone(), Value::Null),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone(), Value::Null),
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "Internal Server Error".to_string(),
                    Value::Null,
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "kind": kind,
            "details": details,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_business_rejections_map_to_client_errors() {
        let window = StudioError::CancellationWindowViolation {
            minutes_remaining: 90,
            required_hours: 24,
        };
        assert_eq!(status_of(&window), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(details_of(&window)["minutes_remaining"], 90);

        assert_eq!(status_of(&StudioError::not_found("class", Uuid::nil())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&StudioError::CapacityExceeded { capacity: 2, active: 2, frame_size: None }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&StudioError::Unauthorized("not yours".into())),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_storage_errors_hide_details() {
        let response = AppError::from(StudioError::Storage("connection reset".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
