use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::{interval_at, Instant, MissedTickBehavior}};
use tracing::{debug, info, warn};

use crate::{
    cache::{CounterStore, RedisCounterStore},
    config::{CompiledPolicy, RateLimitSettings},
    error::Result,
    fallback::LocalFallbackBucket,
    identity::HeaderIdentityExtractor,
    limiter::{AdmissionControl, AdmissionEngine},
    metrics::Metrics,
    middleware::GatekeeperState,
    redis::{RedisClient, RedisConfig},
};

/// Owns the admission engine and its background maintenance
pub struct RateLimitService {
    engine: Arc<AdmissionEngine>,
    settings: RateLimitSettings,
    metrics: Arc<Metrics>,
}

impl RateLimitService {
    /// Build the service against the Redis instance named in `settings`.
    ///
    /// An unreachable Redis is not fatal: the service starts degraded and
    /// switches over once a probe succeeds.
    pub async fn new(settings: RateLimitSettings, metrics: Arc<Metrics>) -> Result<Self> {
        let client = RedisClient::new(RedisConfig::from(&settings.redis))?;
        let remote = Arc::new(RedisCounterStore::new(client, metrics.clone()));
        Self::with_store(settings, remote, metrics).await
    }

    /// Build the service over any counter store
    pub async fn with_store(
        settings: RateLimitSettings,
        remote: Arc<dyn CounterStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let policy = CompiledPolicy::compile(&settings)?;
        let fallback = Arc::new(LocalFallbackBucket::from_settings(&settings.fallback));

        let engine = AdmissionEngine::new(policy, remote, metrics.clone())
            .with_key_prefix(settings.key_prefix.clone())
            .with_fallback(fallback);

        if settings.enabled {
            if engine.health().await {
                info!("Counter store reachable, using shared counters");
            } else {
                warn!("Counter store unreachable at startup, starting with local fallback");
            }
        } else {
            info!("Rate limiting disabled by configuration");
        }

        Ok(Self {
            engine: Arc::new(engine),
            settings,
            metrics,
        })
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// State for the gatekeeper middleware using the default identity extractor
    pub fn gatekeeper_state(&self) -> GatekeeperState {
        GatekeeperState::new(
            self.engine.clone(),
            Arc::new(HeaderIdentityExtractor::from_settings(&self.settings.identity)),
            self.metrics.clone(),
        )
        .with_include_headers(self.settings.include_headers)
    }

    /// Compile and swap in a new policy. The running policy is kept on error.
    pub fn reload(&self, settings: &RateLimitSettings) -> Result<()> {
        let policy = CompiledPolicy::compile(settings)?;
        self.engine.reload_policy(policy);
        Ok(())
    }

    /// Probe the shared store
    pub async fn health_check(&self) -> bool {
        self.engine.health().await
    }

    /// Drop stale fallback buckets. Returns how many were removed.
    pub fn sweep_fallback(&self) -> usize {
        sweep(&self.engine, &self.metrics)
    }

    /// Spawn the periodic health probe and fallback sweep.
    ///
    /// Runs until `shutdown` changes or its sender is dropped.
    pub fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let probe_every = Duration::from_secs(self.settings.health_probe_interval_secs.max(1));
        let sweep_every = Duration::from_secs(self.settings.fallback.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut probe = interval_at(Instant::now() + probe_every, probe_every);
            probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeper = interval_at(Instant::now() + sweep_every, sweep_every);
            sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                probe_secs = probe_every.as_secs(),
                sweep_secs = sweep_every.as_secs(),
                "Rate limit maintenance started"
            );

            loop {
                tokio::select! {
                    _ = probe.tick() => {
                        let healthy = engine.health().await;
                        debug!(healthy, "Counter store probe");
                    }
                    _ = sweeper.tick() => {
                        sweep(&engine, &metrics);
                    }
                    _ = shutdown.changed() => {
                        info!("Rate limit maintenance stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn sweep(engine: &AdmissionEngine, metrics: &Metrics) -> usize {
    let now = engine.time_source().unix_now();
    let removed = engine.fallback().sweep(now);
    metrics.set_fallback_buckets(engine.fallback().bucket_count());
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{Decision, DecisionSource},
        config::{RateLimitRule, Tier},
        error::RateLimitError,
    };
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn check_and_record(&self, _: &str, _: &RateLimitRule, _: i64) -> Result<Decision> {
            Err(RateLimitError::StoreUnavailable("down".to_string()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(RateLimitError::StoreUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_starts_degraded_when_store_down() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = RateLimitService::with_store(RateLimitSettings::default(), Arc::new(DownStore), metrics)
            .await
            .unwrap();

        assert!(!service.engine().store_health().is_healthy());
        let decision = service.engine().check("ip:1.2.3.4", "/api", Tier::Public).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
    }

    #[tokio::test]
    async fn test_starts_healthy_with_working_store() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = RateLimitService::with_store(
            RateLimitSettings::default(),
            Arc::new(LocalFallbackBucket::default()),
            metrics,
        )
        .await
        .unwrap();

        assert!(service.engine().store_health().is_healthy());
        assert!(service.health_check().await);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let mut settings = RateLimitSettings::default();
        settings.tier_defaults.premium = RateLimitRule::new(10, 0);
        let result = RateLimitService::with_store(
            settings,
            Arc::new(DownStore),
            Arc::new(Metrics::new().unwrap()),
        )
        .await;
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[tokio::test]
    async fn test_reload_keeps_old_policy_on_error() {
        let service = RateLimitService::with_store(
            RateLimitSettings::default(),
            Arc::new(LocalFallbackBucket::default()),
            Arc::new(Metrics::new().unwrap()),
        )
        .await
        .unwrap();

        let mut bad = RateLimitSettings::default();
        bad.tier_defaults.public = RateLimitRule::new(0, 60);
        assert!(service.reload(&bad).is_err());
        assert_eq!(
            service.engine().policy().resolve_rule("/x", Tier::Public),
            RateLimitRule::new(60, 60)
        );
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let service = RateLimitService::with_store(
            RateLimitSettings::default(),
            Arc::new(LocalFallbackBucket::default()),
            Arc::new(Metrics::new().unwrap()),
        )
        .await
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = service.spawn_maintenance(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_fallback_updates_metrics() {
        let service = RateLimitService::with_store(
            RateLimitSettings::default(),
            Arc::new(DownStore),
            Arc::new(Metrics::new().unwrap()),
        )
        .await
        .unwrap();

        service.engine().check("ip:1.2.3.4", "/api", Tier::Public).await.unwrap();
        assert_eq!(service.engine().fallback().bucket_count(), 1);
        // Fresh buckets survive the sweep
        assert_eq!(service.sweep_fallback(), 0);
    }
}
