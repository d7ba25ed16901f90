use chrono::FixedOffset;
use serde::Deserialize;
use std::env;
use tuft_booking::BookingPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub business_rules: BookingPolicy,
    #[serde(default)]
    pub studio: StudioConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_rate_limit")]
    pub requests_per_minute: i64,
}

fn default_rate_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StudioConfig {
    /// Offset of the studio's wall clock from UTC; recurring patterns are
    /// expanded in this zone.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_retries")]
    pub max_transaction_retries: u32,
    /// Upper bound on `weeks_ahead` for one pattern generation request.
    #[serde(default = "default_max_weeks_ahead")]
    pub max_weeks_ahead: u32,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_retries() -> u32 {
    3
}

fn default_max_weeks_ahead() -> u32 {
    tuft_catalog::recurring::DEFAULT_MAX_WEEKS_AHEAD
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            sweep_interval_seconds: default_sweep_interval(),
            max_transaction_retries: default_retries(),
            max_weeks_ahead: default_max_weeks_ahead(),
        }
    }
}

impl StudioConfig {
    pub fn offset(&self) -> Result<FixedOffset, config::ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            config::ConfigError::Message(format!(
                "studio.utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked local overrides
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TUFT__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("TUFT").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
