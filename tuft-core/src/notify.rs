use async_trait::async_trait;
use std::sync::Mutex;
use tuft_shared::Notification;

/// Outbound email/SMS dispatch. Delivery guarantees belong to the
/// implementation; the core treats every send as best-effort.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        notification: &Notification,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Sends each notification in order. Failures are logged and swallowed so a
/// committed booking is never reported as failed because a mail bounced.
pub async fn dispatch_all(sender: &dyn NotificationSender, notifications: &[Notification]) -> usize {
    let mut delivered = 0;
    for notification in notifications {
        match sender.send(notification).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::error!(
                    "Failed to send {} notification {} to user {}: {}",
                    notification.kind.as_str(),
                    notification.id,
                    notification.user_id,
                    e
                );
            }
        }
    }
    delivered
}

/// Writes notifications to the log instead of a provider.
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(
        &self,
        notification: &Notification,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            kind = notification.kind.as_str(),
            user_id = %notification.user_id,
            "Notification: {}",
            notification.payload
        );
        Ok(())
    }
}

/// Keeps every notification in memory; used by tests to assert on side effects.
#[derive(Default)]
pub struct RecordingNotificationSender {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(
        &self,
        notification: &Notification,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.sent
            .lock()
            .map_err(|_| "recording sender poisoned")?
            .push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tuft_shared::NotificationKind;
    use uuid::Uuid;

    struct FailingSender;

    #[async_trait]
    impl NotificationSender for FailingSender {
        async fn send(
            &self,
            _notification: &Notification,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("smtp unavailable".into())
        }
    }

    #[tokio::test]
    async fn test_dispatch_records_in_order() {
        let sender = RecordingNotificationSender::new();
        let first = Notification::new(NotificationKind::BookingConfirmed, Uuid::new_v4(), Utc::now());
        let second = Notification::new(NotificationKind::BookingCancelled, Uuid::new_v4(), Utc::now());

        let delivered = dispatch_all(&sender, &[first.clone(), second.clone()]).await;

        assert_eq!(delivered, 2);
        assert_eq!(sender.sent(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let notification = Notification::new(NotificationKind::PackageExpired, Uuid::new_v4(), Utc::now());
        let delivered = dispatch_all(&FailingSender, &[notification]).await;
        assert_eq!(delivered, 0);
    }
}
