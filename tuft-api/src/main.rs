use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tuft_api::{app, worker, AppState, AuthConfig};
use tuft_catalog::PatternGenerator;
use tuft_core::{LogNotificationSender, NotificationSender, SystemClock};
use tuft_store::{Config, DbClient, PgBookingRepository, RedisClient};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tuft_api=debug,tuft_store=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load config");
    tracing::info!("Starting Tuft API on port {}", config.server.port);

    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to Postgres");
    db.migrate().await.expect("Failed to run migrations");

    let policy = db
        .fetch_business_rules(config.business_rules.clone())
        .await
        .expect("Failed to load business rules");
    tracing::info!(?policy, "Business rules loaded");

    let offset = config.studio.offset().expect("Invalid studio timezone");
    let repo = PgBookingRepository::new(
        db.pool.clone(),
        policy,
        PatternGenerator::new(offset).with_max_weeks_ahead(config.studio.max_weeks_ahead),
        config.studio.max_transaction_retries,
    );

    let redis = match &config.redis {
        Some(redis) => Some(
            RedisClient::new(&redis.url)
                .await
                .expect("Failed to connect to Redis"),
        ),
        None => {
            tracing::warn!("Redis not configured: rate limiting and the sweep lock are disabled");
            None
        }
    };

    let app_state = AppState {
        repo: Arc::new(repo),
        clock: Arc::new(SystemClock),
        notifier: notification_sender(&config),
        redis,
        requests_per_minute: config.redis.as_ref().map_or(100, |r| r.requests_per_minute),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    };

    worker::spawn_sweeper(
        app_state.clone(),
        Duration::from_secs(config.studio.sweep_interval_seconds.max(1)),
    );

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("Server error");
}

#[cfg(feature = "kafka")]
fn notification_sender(config: &Config) -> Arc<dyn NotificationSender> {
    match &config.kafka {
        Some(kafka) => Arc::new(
            tuft_store::EventProducer::new(&kafka.brokers).expect("Failed to create Kafka producer"),
        ),
        None => Arc::new(LogNotificationSender),
    }
}

#[cfg(not(feature = "kafka"))]
fn notification_sender(config: &Config) -> Arc<dyn NotificationSender> {
    if config.kafka.is_some() {
        tracing::warn!("Kafka configured but the `kafka` feature is off; logging notifications instead");
    }
    Arc::new(LogNotificationSender)
}
