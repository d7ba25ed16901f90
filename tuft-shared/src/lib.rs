pub mod models;
pub mod pii;

pub use models::events::{Notification, NotificationKind};
pub use pii::Masked;
