pub mod clock;
pub mod identity;
pub mod notify;

pub use clock::{Clock, FixedClock, SystemClock};
pub use identity::{Caller, Role};
pub use notify::{LogNotificationSender, NotificationSender, RecordingNotificationSender};

use uuid::Uuid;

/// Every failure the booking core can report to a caller.
///
/// Variants carry enough context for the HTTP layer to explain the rejection
/// (remaining minutes, seats taken, credits used) without a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {detail}")]
    AlreadyExists { entity: &'static str, detail: String },

    #[error("Capacity exceeded: {active} of {capacity} seats taken{}", .frame_size.as_ref().map(|f| format!(" in frame bucket {}", f)).unwrap_or_default())]
    CapacityExceeded {
        capacity: u32,
        active: u32,
        frame_size: Option<String>,
    },

    #[error("Insufficient credits on package {package_id}: {used_credits} of {total_credits} used (status {status})")]
    InsufficientCredits {
        package_id: Uuid,
        used_credits: u32,
        total_credits: u32,
        status: String,
    },

    #[error("Package {package_id} is bound to class type {package_class_type}, target class is {target_class_type}")]
    PackageClassTypeMismatch {
        package_id: Uuid,
        package_class_type: Uuid,
        target_class_type: Uuid,
    },

    #[error("Cancellation window violated: {minutes_remaining} minutes before start, {required_hours}h notice required")]
    CancellationWindowViolation {
        minutes_remaining: i64,
        required_hours: i64,
    },

    #[error("Invalid state transition for {entity} from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Class {0} is not in progress")]
    NotInProgress(Uuid),

    #[error("Class {0} has no checked-in students")]
    NoCheckedInStudents(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StudioError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StudioError::NotFound { entity, id: id.to_string() }
    }

    pub fn transition(entity: &'static str, from: &str, to: &str) -> Self {
        StudioError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable kind, used in API bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StudioError::NotFound { .. } => "NOT_FOUND",
            StudioError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StudioError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            StudioError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            StudioError::PackageClassTypeMismatch { .. } => "PACKAGE_CLASS_TYPE_MISMATCH",
            StudioError::CancellationWindowViolation { .. } => "CANCELLATION_WINDOW_VIOLATION",
            StudioError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            StudioError::NotInProgress(_) => "NOT_IN_PROGRESS",
            StudioError::NoCheckedInStudents(_) => "NO_CHECKED_IN_STUDENTS",
            StudioError::Unauthorized(_) => "UNAUTHORIZED",
            StudioError::ValidationError(_) => "VALIDATION_ERROR",
            StudioError::Conflict(_) => "CONFLICT",
            StudioError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether repeating the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StudioError::Conflict(_))
    }
}

pub type StudioResult<T> = Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message_mentions_frame() {
        let err = StudioError::CapacityExceeded {
            capacity: 6,
            active: 6,
            frame_size: Some("LARGE".to_string()),
        };
        assert_eq!(err.to_string(), "Capacity exceeded: 6 of 6 seats taken in frame bucket LARGE");

        let err = StudioError::CapacityExceeded { capacity: 1, active: 1, frame_size: None };
        assert_eq!(err.to_string(), "Capacity exceeded: 1 of 1 seats taken");
    }

    #[test]
    fn test_transition_formats_states() {
        let err = StudioError::transition("reservation", "CANCELLED", "CANCELLED");
        assert_eq!(err.kind(), "INVALID_STATE_TRANSITION");
        assert_eq!(
            err.to_string(),
            "Invalid state transition for reservation from CANCELLED to CANCELLED"
        );
    }

    #[test]
    fn test_only_conflicts_retry() {
        assert!(StudioError::Conflict("40001".into()).is_retryable());
        assert!(!StudioError::Storage("boom".into()).is_retryable());
    }
}
