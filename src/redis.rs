use redis::aio::ConnectionManager;
use std::{future::Future, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use crate::{
    config::RedisSettings,
    error::{RateLimitError, Result},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }
}

/// Counts observed by one sliding-window transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Entries inside the window before this request was recorded
    pub count_before: u64,
}

/// Redis client wrapper for sliding-window operations.
///
/// The connection manager is created on first use, so a client can be built
/// while Redis is down and start working once it comes back.
pub struct RedisClient {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    config: RedisConfig,
}

impl RedisClient {
    /// Create a new Redis client. Only the URL is validated here.
    pub fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Config(format!("Invalid Redis URL '{}': {}", config.url, e))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Establishing Redis connection manager...");
                match tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_connection_manager(),
                )
                .await
                {
                    Ok(Ok(conn)) => {
                        info!("Redis connection manager established");
                        Ok(conn)
                    }
                    Ok(Err(e)) => Err(RateLimitError::Redis(e)),
                    Err(_) => Err(RateLimitError::Timeout(format!(
                        "connecting to Redis took longer than {}ms",
                        self.config.connection_timeout.as_millis()
                    ))),
                }
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run a command future under the configured command timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                self.config.command_timeout.as_millis()
            ))),
        }
    }

    /// Prune, count, record and refresh TTL for one key in a single
    /// MULTI/EXEC transaction.
    ///
    /// Entries with a score at or below `now - window_seconds` are dropped
    /// before counting. The current request is recorded whether or not the
    /// caller ends up admitting it.
    pub async fn sliding_window(
        &self,
        key: &str,
        member: &str,
        now: i64,
        window_seconds: u64,
    ) -> Result<WindowSnapshot> {
        let mut conn = self.connection().await?;
        let window = i64::try_from(window_seconds).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(window);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(key, "-inf", cutoff)
            .ignore()
            .zcard(key)
            .zadd(key, member, now)
            .ignore()
            .expire(key, window)
            .ignore();

        let (count_before,): (u64,) = self
            .bounded("sliding window transaction", pipe.query_async(&mut conn))
            .await?;

        Ok(WindowSnapshot { count_before })
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        self.bounded::<(), _>("PING", cmd.query_async(&mut conn)).await
    }
}
