pub mod app_config;
pub mod database;
mod rows;
pub mod booking_repo;
pub mod redis_repo;
#[cfg(feature = "kafka")]
pub mod events;

pub use app_config::Config;
pub use booking_repo::PgBookingRepository;
pub use database::DbClient;
pub use redis_repo::RedisClient;
#[cfg(feature = "kafka")]
pub use events::EventProducer;
