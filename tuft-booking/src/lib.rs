pub mod models;
pub mod policy;
pub mod ledger;
pub mod waitlist;
pub mod manager;
pub mod changes;
pub mod expiry;
pub mod studio;
pub mod repository;

pub use models::{
    CreditMovement, CreditMovementKind, NewPackage, Package, PackageKind, PackageStatus, Reservation,
    ReservationStatus, WaitlistEntry,
};
pub use policy::{BookingPolicy, FrameMatching};
pub use ledger::CreditLedger;
pub use waitlist::Waitlist;
pub use manager::{
    BookingOutcome, CancelActor, CancellationOutcome, CapacityChangeOutcome, ClassBook,
    ClassCancellationOutcome, CompletionOutcome, Promotion,
};
pub use changes::RescheduleOutcome;
pub use expiry::{ExpirySweep, PackageExpirySweeper};
pub use studio::Studio;
pub use repository::{BookRequest, BookingRepository, ClassView, MemoryBookingRepository};
