use std::sync::Arc;
use tuft_booking::BookingRepository;
use tuft_core::{Clock, NotificationSender};
use tuft_store::RedisClient;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn BookingRepository>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn NotificationSender>,
    /// Rate limiting and the sweep lock are skipped when absent.
    pub redis: Option<RedisClient>,
    pub requests_per_minute: i64,
    pub auth: AuthConfig,
}
