use async_trait::async_trait;
use std::{sync::Arc, time::Instant};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::RateLimitRule,
    error::Result,
    metrics::Metrics,
    redis::RedisClient,
};

/// Which path produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Shared counter store
    Remote,
    /// Process-local fallback bucket
    Fallback,
    /// Rate limiting globally disabled
    Disabled,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Remote => "remote",
            DecisionSource::Fallback => "fallback",
            DecisionSource::Disabled => "disabled",
        }
    }
}

/// Result of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub window_seconds: u64,
    pub reset_at: i64,
    /// Only set on denial
    pub retry_after: Option<u64>,
    pub source: DecisionSource,
}

impl Decision {
    /// Build a decision from the number of entries already in the window
    /// when this request arrived.
    pub fn from_count(
        count_before: u64,
        rule: &RateLimitRule,
        now: i64,
        source: DecisionSource,
    ) -> Self {
        let limit = u64::from(rule.requests_allowed);
        let reset_at = now.saturating_add(i64::try_from(rule.window_seconds).unwrap_or(i64::MAX));

        if count_before >= limit {
            Self {
                allowed: false,
                remaining: 0,
                limit,
                window_seconds: rule.window_seconds,
                reset_at,
                retry_after: Some(rule.window_seconds),
                source,
            }
        } else {
            Self {
                allowed: true,
                remaining: limit.saturating_sub(count_before).saturating_sub(1),
                limit,
                window_seconds: rule.window_seconds,
                reset_at,
                retry_after: None,
                source,
            }
        }
    }

    /// Allowed without touching any store
    pub fn unlimited(now: i64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            window_seconds: 0,
            reset_at: now,
            retry_after: None,
            source: DecisionSource::Disabled,
        }
    }
}

/// A counter backend able to run one sliding-window check atomically
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune expired entries for `key`, count the rest, record `now` and
    /// decide against `rule`.
    async fn check_and_record(&self, key: &str, rule: &RateLimitRule, now: i64) -> Result<Decision>;

    /// Lightweight liveness probe
    async fn health_check(&self) -> Result<()>;
}

/// Redis-backed sliding window over one sorted set per counter key
pub struct RedisCounterStore {
    client: RedisClient,
    metrics: Arc<Metrics>,
}

impl RedisCounterStore {
    pub fn new(client: RedisClient, metrics: Arc<Metrics>) -> Self {
        Self { client, metrics }
    }

    /// Sorted-set members must be unique or requests landing in the same
    /// second would overwrite each other.
    fn member(now: i64) -> String {
        format!("{}-{}", now, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_record(&self, key: &str, rule: &RateLimitRule, now: i64) -> Result<Decision> {
        let started = Instant::now();
        let result = self
            .client
            .sliding_window(key, &Self::member(now), now, rule.window_seconds)
            .await;
        self.metrics
            .record_store_operation_duration("sliding_window", started.elapsed().as_secs_f64());

        let snapshot = result?;
        debug!(
            key = %key,
            count_before = snapshot.count_before,
            limit = rule.requests_allowed,
            "Sliding window evaluated"
        );

        Ok(Decision::from_count(snapshot.count_before, rule, now, DecisionSource::Remote))
    }

    async fn health_check(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.client.health_check().await;
        self.metrics
            .record_store_operation_duration("ping", started.elapsed().as_secs_f64());
        result
    }
}
