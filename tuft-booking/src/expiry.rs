use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tuft_shared::{Notification, NotificationKind};
use uuid::Uuid;

use crate::models::{Package, PackageStatus};
use crate::policy::BookingPolicy;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpirySweep {
    pub expired: Vec<Uuid>,
    pub warned: Vec<Uuid>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

impl ExpirySweep {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.warned.is_empty()
    }
}

/// Expires packages past their date and warns owners of packages about to
/// expire. Each package is warned once.
pub struct PackageExpirySweeper {
    warning_window: Duration,
}

impl PackageExpirySweeper {
    pub fn new(policy: &BookingPolicy) -> Self {
        Self {
            warning_window: policy.expiry_warning(),
        }
    }

    pub fn sweep<'a, I>(&self, packages: I, now: DateTime<Utc>) -> ExpirySweep
    where
        I: IntoIterator<Item = &'a mut Package>,
    {
        let mut sweep = ExpirySweep::default();
        for package in packages {
            self.sweep_one(package, now, &mut sweep);
        }
        if !sweep.is_empty() {
            tracing::info!(
                "Package sweep: {} expired, {} warned",
                sweep.expired.len(),
                sweep.warned.len()
            );
        }
        sweep
    }

    fn sweep_one(&self, package: &mut Package, now: DateTime<Utc>, sweep: &mut ExpirySweep) {
        if package.status != PackageStatus::Active {
            return;
        }
        let Some(expires_at) = package.expires_at else {
            return;
        };

        if expires_at < now {
            package.status = PackageStatus::Expired;
            package.updated_at = now;
            sweep.expired.push(package.id);
            sweep.notifications.push(
                Notification::new(NotificationKind::PackageExpired, package.user_id, now)
                    .for_package(package.id)
                    .with_payload(serde_json::json!({
                        "name": package.name,
                        "expired_at": expires_at,
                        "unused_credits": package.remaining_credits(),
                    })),
            );
            return;
        }

        if package.expiry_warning_sent_at.is_none() && expires_at - now <= self.warning_window {
            package.expiry_warning_sent_at = Some(now);
            package.updated_at = now;
            sweep.warned.push(package.id);
            sweep.notifications.push(
                Notification::new(NotificationKind::PackageExpiryWarning, package.user_id, now)
                    .for_package(package.id)
                    .with_payload(serde_json::json!({
                        "name": package.name,
                        "expires_at": expires_at,
                        "remaining_credits": package.remaining_credits(),
                    })),
            );
        }
    }
}
