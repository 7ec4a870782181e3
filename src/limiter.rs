use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use crate::{
    cache::{CounterStore, Decision},
    config::{CompiledPolicy, Tier},
    error::Result,
    fallback::LocalFallbackBucket,
    metrics::Metrics,
    utils::{generate_counter_key, SystemTimeSource, TimeSource},
};

/// Whether the shared counter store should be used.
///
/// Set unhealthy on the first store failure; cleared only by a successful
/// probe, never by a request served from the fallback.
#[derive(Debug)]
pub struct StoreHealth {
    healthy: AtomicBool,
    last_probe: Mutex<Option<DateTime<Utc>>>,
}

impl StoreHealth {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_probe: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns true if this call flipped the flag
    pub fn mark_unhealthy(&self) -> bool {
        self.healthy.swap(false, Ordering::AcqRel)
    }

    /// Returns true if this call flipped the flag
    pub fn mark_healthy(&self) -> bool {
        !self.healthy.swap(true, Ordering::AcqRel)
    }

    pub fn record_probe(&self, at: DateTime<Utc>) {
        *self.last_probe.lock() = Some(at);
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        *self.last_probe.lock()
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission decisions as seen by the request path
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Whether `endpoint` bypasses admission control entirely
    fn is_exempt(&self, endpoint: &str) -> bool;

    /// Decide whether `identity` may call `endpoint` under `tier`.
    ///
    /// Store failures are absorbed; an `Err` here is an unexpected fault.
    async fn check(&self, identity: &str, endpoint: &str, tier: Tier) -> Result<Decision>;

    /// Probe the shared store and update the health flag
    async fn health(&self) -> bool;
}

/// Coordinates the policy, the shared counter store and the local fallback
pub struct AdmissionEngine {
    policy: RwLock<Arc<CompiledPolicy>>,
    key_prefix: String,
    remote: Arc<dyn CounterStore>,
    fallback: Arc<LocalFallbackBucket>,
    health: Arc<StoreHealth>,
    time_source: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
}

impl AdmissionEngine {
    /// Create an engine over `remote` with a default fallback, health flag
    /// and system clock
    pub fn new(policy: CompiledPolicy, remote: Arc<dyn CounterStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            key_prefix: String::new(),
            remote,
            fallback: Arc::new(LocalFallbackBucket::default()),
            health: Arc::new(StoreHealth::new()),
            time_source: Arc::new(SystemTimeSource::new()),
            metrics,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<LocalFallbackBucket>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_health(mut self, health: Arc<StoreHealth>) -> Self {
        self.metrics.set_store_healthy(health.is_healthy());
        self.health = health;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Current policy snapshot
    pub fn policy(&self) -> Arc<CompiledPolicy> {
        self.policy.read().clone()
    }

    /// Swap in a new policy snapshot. In-flight checks keep the old one.
    pub fn reload_policy(&self, policy: CompiledPolicy) {
        *self.policy.write() = Arc::new(policy);
        info!("Rate limit policy reloaded");
    }

    pub fn store_health(&self) -> &Arc<StoreHealth> {
        &self.health
    }

    pub fn fallback(&self) -> &Arc<LocalFallbackBucket> {
        &self.fallback
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }
}

#[async_trait]
impl AdmissionControl for AdmissionEngine {
    fn is_exempt(&self, endpoint: &str) -> bool {
        self.policy.read().is_exempt(endpoint)
    }

    async fn check(&self, identity: &str, endpoint: &str, tier: Tier) -> Result<Decision> {
        let _timer = self.metrics.start_admission_timer();
        let policy = self.policy();
        let now = self.time_source.unix_now();

        if !policy.enabled() {
            return Ok(Decision::unlimited(now));
        }

        let rule = policy.resolve_rule(endpoint, tier);
        let key = generate_counter_key(&self.key_prefix, identity, endpoint);

        let decision = if self.health.is_healthy() {
            match self.remote.check_and_record(&key, &rule, now).await {
                Ok(decision) => decision,
                Err(e) if e.is_store_failure() => {
                    self.metrics.record_store_failure(e.kind());
                    if self.health.mark_unhealthy() {
                        warn!(error = %e, "Counter store unavailable, switching to local fallback");
                        self.metrics.set_store_healthy(false);
                    }
                    self.fallback.check(&key, &rule, now)
                }
                Err(e) => return Err(e),
            }
        } else {
            self.fallback.check(&key, &rule, now)
        };

        self.metrics.record_decision(decision.allowed, decision.source.as_str());

        if decision.allowed {
            debug!(
                key = %key,
                tier = %tier,
                remaining = decision.remaining,
                source = decision.source.as_str(),
                "Request admitted"
            );
        } else {
            info!(
                key = %key,
                tier = %tier,
                limit = decision.limit,
                window_seconds = decision.window_seconds,
                source = decision.source.as_str(),
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn health(&self) -> bool {
        let result = self.remote.health_check().await;
        self.health.record_probe(self.time_source.utc_now());

        match result {
            Ok(()) => {
                if self.health.mark_healthy() {
                    info!("Counter store recovered, resuming shared counters");
                }
                self.metrics.set_store_healthy(true);
                true
            }
            Err(e) => {
                if self.health.mark_unhealthy() {
                    warn!(error = %e, "Counter store health probe failed, using local fallback");
                } else {
                    debug!(error = %e, "Counter store still unavailable");
                }
                self.metrics.record_store_failure(e.kind());
                self.metrics.set_store_healthy(false);
                false
            }
        }
    }
}
