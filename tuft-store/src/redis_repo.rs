use redis::RedisResult;
use tracing::{debug, info};

/// Thin wrapper over a Redis client. Redis is optional: it backs the API
/// rate limiter and the lock that keeps periodic sweeps to one instance.
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter; returns false once `limit` is exceeded within
    /// the window.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }

    /// SET NX EX. True when this owner now holds the lock.
    pub async fn acquire_lock(&self, name: &str, owner: &str, ttl_seconds: u64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("lock:{}", name);

        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        debug!("Lock {} for {}: {}", key, owner, if acquired { "acquired" } else { "busy" });
        Ok(acquired)
    }

    /// Deletes the lock only if `owner` still holds it.
    pub async fn release_lock(&self, name: &str, owner: &str) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("lock:{}", name);
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#,
        );

        let deleted: i64 = script.key(&key).arg(owner).invoke_async(&mut conn).await?;
        if deleted > 0 {
            info!("Released lock {}", key);
        }
        Ok(deleted > 0)
    }
}
