use chrono::{DateTime, Utc};
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

use crate::models::{CreditMovement, CreditMovementKind, Package, PackageStatus};

/// Credit accounting on packages. Keeps `0 <= used <= total` and the
/// USED_UP/ACTIVE status in step with the balance.
pub struct CreditLedger;

impl CreditLedger {
    /// ACTIVE, not past expiry, at least one credit left.
    pub fn is_usable(package: &Package, now: DateTime<Utc>) -> bool {
        package.status == PackageStatus::Active
            && !package.is_past_expiry(now)
            && package.used_credits < package.total_credits
    }

    pub fn ensure_usable(package: &Package, now: DateTime<Utc>) -> StudioResult<()> {
        if Self::is_usable(package, now) {
            return Ok(());
        }
        let status = if package.status == PackageStatus::Active && package.is_past_expiry(now) {
            PackageStatus::Expired
        } else {
            package.status
        };
        Err(StudioError::InsufficientCredits {
            package_id: package.id,
            used_credits: package.used_credits,
            total_credits: package.total_credits,
            status: status.to_string(),
        })
    }

    /// Consumes `amount` credits. The package flips to USED_UP on the last one.
    pub fn debit(
        package: &mut Package,
        amount: u32,
        reservation_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> StudioResult<CreditMovement> {
        Self::ensure_usable(package, now)?;
        let used_after = package.used_credits + amount;
        if used_after > package.total_credits {
            return Err(StudioError::InsufficientCredits {
                package_id: package.id,
                used_credits: package.used_credits,
                total_credits: package.total_credits,
                status: package.status.to_string(),
            });
        }

        package.used_credits = used_after;
        if package.used_credits == package.total_credits {
            package.status = PackageStatus::UsedUp;
        }
        package.updated_at = now;

        tracing::debug!(
            "Package {} debited {} credits ({}/{})",
            package.id,
            amount,
            package.used_credits,
            package.total_credits
        );

        Ok(Self::movement(package, reservation_id, CreditMovementKind::Debit, amount, now))
    }

    /// Gives back up to `amount` credits, never going below zero.
    /// USED_UP returns to ACTIVE; EXPIRED stays EXPIRED.
    pub fn restore(
        package: &mut Package,
        amount: u32,
        reservation_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> CreditMovement {
        let restored = amount.min(package.used_credits);
        if restored < amount {
            tracing::warn!(
                "Package {} restore clamped: requested {}, used {}",
                package.id,
                amount,
                package.used_credits
            );
        }

        package.used_credits -= restored;
        if package.status == PackageStatus::UsedUp && package.used_credits < package.total_credits {
            package.status = PackageStatus::Active;
        }
        package.updated_at = now;

        Self::movement(package, reservation_id, CreditMovementKind::Restore, restored, now)
    }

    fn movement(
        package: &Package,
        reservation_id: Option<Uuid>,
        kind: CreditMovementKind,
        amount: u32,
        now: DateTime<Utc>,
    ) -> CreditMovement {
        CreditMovement {
            id: Uuid::new_v4(),
            package_id: package.id,
            reservation_id,
            kind,
            amount,
            used_after: package.used_credits,
            created_at: now,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{NewPackage, PackageKind};
    use chrono::Duration;
    use proptest::prelude::*;

    pub(crate) fn active_package(user_id: Uuid, credits: u32, now: DateTime<Utc>) -> Package {
        Package::new(
            NewPackage {
                user_id,
                name: format!("{} class pack", credits),
                kind: PackageKind::Standard,
                total_credits: credits,
                class_type_id: None,
                price_cents: 9000 * i64::from(credits),
                expires_at: Some(now + Duration::days(60)),
                paid: true,
            },
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_last_credit_marks_used_up() {
        let now = Utc::now();
        let mut package = active_package(Uuid::new_v4(), 2, now);

        CreditLedger::debit(&mut package, 1, None, now).unwrap();
        assert_eq!(package.status, PackageStatus::Active);
        let movement = CreditLedger::debit(&mut package, 1, None, now).unwrap();

        assert_eq!(package.status, PackageStatus::UsedUp);
        assert_eq!(movement.used_after, 2);
        assert!(!CreditLedger::is_usable(&package, now));
        assert!(matches!(
            CreditLedger::debit(&mut package, 1, None, now),
            Err(StudioError::InsufficientCredits { used_credits: 2, total_credits: 2, .. })
        ));
    }

    #[test]
    fn test_restore_reactivates_used_up() {
        let now = Utc::now();
        let mut package = active_package(Uuid::new_v4(), 1, now);
        CreditLedger::debit(&mut package, 1, None, now).unwrap();

        let movement = CreditLedger::restore(&mut package, 1, None, now);

        assert_eq!(movement.kind, CreditMovementKind::Restore);
        assert_eq!(movement.amount, 1);
        assert_eq!(package.used_credits, 0);
        assert_eq!(package.status, PackageStatus::Active);
    }

    #[test]
    fn test_restore_keeps_expired_status() {
        let now = Utc::now();
        let mut package = active_package(Uuid::new_v4(), 4, now);
        CreditLedger::debit(&mut package, 1, None, now).unwrap();
        package.status = PackageStatus::Expired;

        CreditLedger::restore(&mut package, 1, None, now);

        assert_eq!(package.used_credits, 0);
        assert_eq!(package.status, PackageStatus::Expired);
    }

    #[test]
    fn test_restore_clamps_at_zero() {
        let now = Utc::now();
        let mut package = active_package(Uuid::new_v4(), 3, now);
        let movement = CreditLedger::restore(&mut package, 1, None, now);
        assert_eq!(movement.amount, 0);
        assert_eq!(package.used_credits, 0);
    }

    #[test]
    fn test_expired_by_time_is_not_usable() {
        let now = Utc::now();
        let package = active_package(Uuid::new_v4(), 3, now);
        let later = now + Duration::days(61);
        assert!(!CreditLedger::is_usable(&package, later));
        assert!(matches!(
            CreditLedger::ensure_usable(&package, later),
            Err(StudioError::InsufficientCredits { ref status, .. }) if status == "EXPIRED"
        ));
    }

    #[test]
    fn test_pending_payment_is_not_usable() {
        let now = Utc::now();
        let mut package = active_package(Uuid::new_v4(), 3, now);
        package.status = PackageStatus::PendingPayment;
        assert!(CreditLedger::debit(&mut package, 1, None, now).is_err());
        assert_eq!(package.used_credits, 0);
    }

    proptest! {
        #[test]
        fn prop_used_credits_stay_in_bounds(total in 1u32..8, ops in prop::collection::vec(any::<bool>(), 0..40)) {
            let now = Utc::now();
            let mut package = active_package(Uuid::new_v4(), total, now);
            for debit in ops {
                if debit {
                    let _ = CreditLedger::debit(&mut package, 1, None, now);
                } else {
                    CreditLedger::restore(&mut package, 1, None, now);
                }
                prop_assert!(package.used_credits <= package.total_credits);
                prop_assert_eq!(
                    package.status == PackageStatus::UsedUp,
                    package.used_credits == package.total_credits
                );
            }
        }
    }
}
