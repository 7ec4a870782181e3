// Step-by-step startup diagnostic for the gatekeeper
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::{sync::Arc, time::{Duration, Instant}};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatekeeper_ratelimit::{
    config::{load_settings, Tier},
    limiter::AdmissionControl,
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    service::RateLimitService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with more verbose output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting debug startup test...");
    let start_time = Instant::now();

    let settings = load_settings(std::env::var("CONFIG_PATH").ok().as_deref())?;
    info!("Configuration loaded: enabled={}, key_prefix={}", settings.enabled, settings.key_prefix);

    let redis_ok = test_redis_connection(RedisConfig::from(&settings.redis)).await;
    if let Err(e) = &redis_ok {
        warn!("Redis checks failed ({}), admission will run on the local fallback", e);
    }

    test_admission(settings).await?;

    info!("All checks completed in {:?}", start_time.elapsed());
    Ok(())
}

async fn test_redis_connection(config: RedisConfig) -> Result<()> {
    info!("Testing Redis connection to {}...", config.url);

    let client = RedisClient::new(config)?;

    let health_start = Instant::now();
    match client.health_check().await {
        Ok(()) => info!("PING passed in {:?}", health_start.elapsed()),
        Err(e) => {
            error!("PING failed after {:?}: {}", health_start.elapsed(), e);
            return Err(e.into());
        }
    }

    let key = format!("debug_startup:{}", uuid::Uuid::new_v4().simple());
    let now = chrono::Utc::now().timestamp();
    let window_start = Instant::now();
    let snapshot = client.sliding_window(&key, "probe", now, 5).await?;
    info!(
        "Sliding window transaction on {} returned count_before={} in {:?}",
        key,
        snapshot.count_before,
        window_start.elapsed()
    );

    Ok(())
}

async fn test_admission(settings: gatekeeper_ratelimit::RateLimitSettings) -> Result<()> {
    info!("Building rate limit service...");
    let metrics = Arc::new(Metrics::new()?);

    let service = tokio::time::timeout(
        Duration::from_secs(10),
        RateLimitService::new(settings, metrics),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Service construction timed out"))??;

    let engine = service.engine();
    info!("Store healthy: {}", engine.store_health().is_healthy());

    for i in 1..=3 {
        let check_start = Instant::now();
        let decision = engine.check("ip:127.0.0.1", "/debug/startup", Tier::Public).await?;
        info!(
            "Check {}: allowed={} remaining={} limit={} source={} in {:?}",
            i,
            decision.allowed,
            decision.remaining,
            decision.limit,
            decision.source.as_str(),
            check_start.elapsed()
        );
    }

    Ok(())
}
