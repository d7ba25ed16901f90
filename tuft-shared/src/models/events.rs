use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a notification is about. The sender decides the channel (email, SMS).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BookingConfirmed,
    BookingCancelled,
    WaitlistPromoted,
    Rescheduled,
    ClassCancelled,
    PackageExpired,
    PackageExpiryWarning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::WaitlistPromoted => "waitlist_promoted",
            NotificationKind::Rescheduled => "rescheduled",
            NotificationKind::ClassCancelled => "class_cancelled",
            NotificationKind::PackageExpired => "package_expired",
            NotificationKind::PackageExpiryWarning => "package_expiry_warning",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub user_id: Uuid,
    pub class_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub package_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, user_id: Uuid, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id,
            class_id: None,
            reservation_id: None,
            package_id: None,
            payload: serde_json::Value::Null,
            occurred_at,
        }
    }

    pub fn for_class(mut self, class_id: Uuid) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn for_reservation(mut self, reservation_id: Uuid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn for_package(mut self, package_id: Uuid) -> Self {
        self.package_id = Some(package_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Routing key used by message brokers: one topic per kind.
    pub fn topic(&self) -> String {
        format!("notifications.{}", self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_links_entities() {
        let user_id = Uuid::new_v4();
        let class_id = Uuid::new_v4();
        let reservation_id = Uuid::new_v4();

        let notification = Notification::new(NotificationKind::WaitlistPromoted, user_id, Utc::now())
            .for_class(class_id)
            .for_reservation(reservation_id)
            .with_payload(serde_json::json!({"priority": 1}));

        assert_eq!(notification.user_id, user_id);
        assert_eq!(notification.class_id, Some(class_id));
        assert_eq!(notification.reservation_id, Some(reservation_id));
        assert_eq!(notification.package_id, None);
        assert_eq!(notification.topic(), "notifications.waitlist_promoted");
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&NotificationKind::PackageExpiryWarning).unwrap();
        assert_eq!(json, "\"PACKAGE_EXPIRY_WARNING\"");
    }
}
