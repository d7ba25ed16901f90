use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tuft_catalog::FrameSize;
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

/// Reservation lifecycle:
/// CONFIRMED → CHECKED_IN → COMPLETED, CONFIRMED → CANCELLED, CONFIRMED → NO_SHOW,
/// CHECKED_IN → CANCELLED. COMPLETED, CANCELLED and NO_SHOW are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::CheckedIn => "CHECKED_IN",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::NoShow => "NO_SHOW",
        }
    }

    /// Holds a seat.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::CheckedIn)
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Confirmed, CheckedIn)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (CheckedIn, Completed)
                | (CheckedIn, Cancelled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "CHECKED_IN" => Ok(ReservationStatus::CheckedIn),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "NO_SHOW" => Ok(ReservationStatus::NoShow),
            other => Err(StudioError::ValidationError(format!(
                "unknown reservation status {}",
                other
            ))),
        }
    }
}

/// One student's seat in one class.
///
/// A reservation is either funded by a package credit (`package_id` set) or
/// pay-later, in which case `payment_deadline` applies until `paid_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub class_id: Uuid,
    pub status: ReservationStatus,
    pub package_id: Option<Uuid>,
    pub frame_size: Option<FrameSize>,
    pub payment_deadline: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    fn confirmed(
        id: Uuid,
        user_id: Uuid,
        class_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            class_id,
            status: ReservationStatus::Confirmed,
            package_id: None,
            frame_size,
            payment_deadline: None,
            paid_at: None,
            cancellation_reason: None,
            cancelled_at: None,
            checked_in_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn funded(
        id: Uuid,
        user_id: Uuid,
        class_id: Uuid,
        frame_size: Option<FrameSize>,
        package_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let mut reservation = Self::confirmed(id, user_id, class_id, frame_size, now);
        reservation.package_id = Some(package_id);
        reservation
    }

    pub fn pay_later(
        id: Uuid,
        user_id: Uuid,
        class_id: Uuid,
        frame_size: Option<FrameSize>,
        payment_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut reservation = Self::confirmed(id, user_id, class_id, frame_size, now);
        reservation.payment_deadline = Some(payment_deadline);
        reservation
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_funded(&self) -> bool {
        self.package_id.is_some()
    }

    /// Unfunded, unpaid, still CONFIRMED and past its deadline.
    pub fn is_payment_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Confirmed
            && self.package_id.is_none()
            && self.paid_at.is_none()
            && self.payment_deadline.map_or(false, |deadline| deadline < now)
    }

    pub fn transition(&mut self, next: ReservationStatus, now: DateTime<Utc>) -> StudioResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(StudioError::transition(
                "reservation",
                self.status.as_str(),
                next.as_str(),
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Active,
    PendingPayment,
    UsedUp,
    Expired,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Active => "ACTIVE",
            PackageStatus::PendingPayment => "PENDING_PAYMENT",
            PackageStatus::UsedUp => "USED_UP",
            PackageStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(PackageStatus::Active),
            "PENDING_PAYMENT" => Ok(PackageStatus::PendingPayment),
            "USED_UP" => Ok(PackageStatus::UsedUp),
            "EXPIRED" => Ok(PackageStatus::Expired),
            other => Err(StudioError::ValidationError(format!(
                "unknown package status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageKind {
    Standard,
    Intensive,
    Recurrent,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Standard => "STANDARD",
            PackageKind::Intensive => "INTENSIVE",
            PackageKind::Recurrent => "RECURRENT",
        }
    }
}

impl FromStr for PackageKind {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(PackageKind::Standard),
            "INTENSIVE" => Ok(PackageKind::Intensive),
            "RECURRENT" => Ok(PackageKind::Recurrent),
            other => Err(StudioError::ValidationError(format!(
                "unknown package kind {}",
                other
            ))),
        }
    }
}

/// A prepaid bundle of class credits owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: PackageKind,
    pub total_credits: u32,
    pub used_credits: u32,
    pub status: PackageStatus,
    /// Restricts the package to one class type when set.
    pub class_type_id: Option<Uuid>,
    pub price_cents: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_warning_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPackage {
    pub user_id: Uuid,
    pub name: String,
    pub kind: PackageKind,
    pub total_credits: u32,
    #[serde(default)]
    pub class_type_id: Option<Uuid>,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Paid packages start ACTIVE, the rest wait in PENDING_PAYMENT.
    #[serde(default)]
    pub paid: bool,
}

impl Package {
    pub fn new(new: NewPackage, now: DateTime<Utc>) -> StudioResult<Self> {
        if new.total_credits == 0 {
            return Err(StudioError::ValidationError(
                "package must hold at least one credit".to_string(),
            ));
        }
        if new.price_cents < 0 {
            return Err(StudioError::ValidationError(
                "package price cannot be negative".to_string(),
            ));
        }
        if new.expires_at.map_or(false, |expires_at| expires_at <= now) {
            return Err(StudioError::ValidationError(
                "package expiry must be in the future".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            name: new.name,
            kind: new.kind,
            total_credits: new.total_credits,
            used_credits: 0,
            status: if new.paid {
                PackageStatus::Active
            } else {
                PackageStatus::PendingPayment
            },
            class_type_id: new.class_type_id,
            price_cents: new.price_cents,
            expires_at: new.expires_at,
            expiry_warning_sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn remaining_credits(&self) -> u32 {
        self.total_credits.saturating_sub(self.used_credits)
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at < now)
    }

    /// PENDING_PAYMENT → ACTIVE once the purchase is paid.
    pub fn activate(&mut self, now: DateTime<Utc>) -> StudioResult<()> {
        if self.status != PackageStatus::PendingPayment {
            return Err(StudioError::transition(
                "package",
                self.status.as_str(),
                PackageStatus::Active.as_str(),
            ));
        }
        self.status = if self.is_past_expiry(now) {
            PackageStatus::Expired
        } else {
            PackageStatus::Active
        };
        self.updated_at = now;
        Ok(())
    }
}

/// One user's place in a class queue. Priorities are dense: 1..=N.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub class_id: Uuid,
    pub frame_size: Option<FrameSize>,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditMovementKind {
    Debit,
    Restore,
}

impl CreditMovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditMovementKind::Debit => "DEBIT",
            CreditMovementKind::Restore => "RESTORE",
        }
    }
}

impl FromStr for CreditMovementKind {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(CreditMovementKind::Debit),
            "RESTORE" => Ok(CreditMovementKind::Restore),
            other => Err(StudioError::ValidationError(format!(
                "unknown credit movement {}",
                other
            ))),
        }
    }
}

/// Audit row for every change to a package's used credits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditMovement {
    pub id: Uuid,
    pub package_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub kind: CreditMovementKind,
    pub amount: u32,
    pub used_after: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_transition_table() {
        use ReservationStatus::*;
        assert!(Confirmed.can_transition_to(CheckedIn));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(CheckedIn.can_transition_to(Cancelled));
        assert!(!CheckedIn.can_transition_to(NoShow));
        assert!(!Confirmed.can_transition_to(Completed));
        for terminal in [Completed, Cancelled, NoShow] {
            for next in [Confirmed, CheckedIn, Completed, Cancelled, NoShow] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cancelled_reservation_cannot_be_cancelled_again() {
        let now = Utc::now();
        let mut r = Reservation::pay_later(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None, now, now);
        r.transition(ReservationStatus::Cancelled, now).unwrap();
        let err = r.transition(ReservationStatus::Cancelled, now).unwrap_err();
        assert_eq!(err, StudioError::transition("reservation", "CANCELLED", "CANCELLED"));
    }

    #[test]
    fn test_payment_overdue_only_for_unpaid_pay_later() {
        let now = Utc::now();
        let deadline = now - Duration::minutes(1);
        let mut r = Reservation::pay_later(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None, deadline, now);
        assert!(r.is_payment_overdue(now));

        r.paid_at = Some(now);
        assert!(!r.is_payment_overdue(now));

        let funded = Reservation::funded(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None, Uuid::new_v4(), now);
        assert!(!funded.is_payment_overdue(now + Duration::days(30)));
    }

    #[test]
    fn test_new_package_status_follows_payment() {
        let now = Utc::now();
        let new = NewPackage {
            user_id: Uuid::new_v4(),
            name: "Five pack".to_string(),
            kind: PackageKind::Standard,
            total_credits: 5,
            class_type_id: None,
            price_cents: 40000,
            expires_at: Some(now + Duration::days(90)),
            paid: false,
        };
        let mut package = Package::new(new.clone(), now).unwrap();
        assert_eq!(package.status, PackageStatus::PendingPayment);
        assert_eq!(package.remaining_credits(), 5);

        package.activate(now).unwrap();
        assert_eq!(package.status, PackageStatus::Active);
        assert!(package.activate(now).is_err());

        let paid = Package::new(NewPackage { paid: true, ..new }, now).unwrap();
        assert_eq!(paid.status, PackageStatus::Active);
    }

    #[test]
    fn test_package_rejects_zero_credits() {
        let now = Utc::now();
        let new = NewPackage {
            user_id: Uuid::new_v4(),
            name: "Empty".to_string(),
            kind: PackageKind::Intensive,
            total_credits: 0,
            class_type_id: None,
            price_cents: 0,
            expires_at: None,
            paid: true,
        };
        assert!(matches!(Package::new(new, now), Err(StudioError::ValidationError(_))));
    }
}
