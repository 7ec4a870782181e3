use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::debug;

use crate::{
    cache::{CounterStore, Decision, DecisionSource},
    config::{FallbackSettings, RateLimitRule},
    error::Result,
};

/// On-access sweep runs roughly once per this many checks
const SWEEP_EVERY: u64 = 1024;

/// Recorded attempts for one counter key
#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<i64>,
    /// Window of the rule last applied to this key
    window: i64,
}

/// In-process sliding window used while the shared store is unavailable.
///
/// Enforcement is per process only: with several replicas each one keeps its
/// own independent quota while degraded.
pub struct LocalFallbackBucket {
    buckets: Mutex<HashMap<String, Bucket>>,
    stale_after: Duration,
    ops: AtomicU64,
}

impl LocalFallbackBucket {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            stale_after,
            ops: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &FallbackSettings) -> Self {
        Self::new(Duration::from_secs(settings.stale_after_secs))
    }

    /// Prune, count and record under the map lock
    pub fn check(&self, key: &str, rule: &RateLimitRule, now: i64) -> Decision {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }

        let window = i64::try_from(rule.window_seconds).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(window);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_default();
        bucket.window = window;
        let entries = &mut bucket.entries;

        while entries.front().is_some_and(|&ts| ts <= cutoff) {
            entries.pop_front();
        }

        let count_before = entries.len() as u64;
        // Attempts are recorded even when denied, same as the remote store
        entries.push_back(now);

        Decision::from_count(count_before, rule, now, DecisionSource::Fallback)
    }

    /// Drop buckets whose newest entry is older than both the stale threshold
    /// and the bucket's own window. Returns the number of buckets removed.
    pub fn sweep(&self, now: i64) -> usize {
        let stale_after = i64::try_from(self.stale_after.as_secs()).unwrap_or(i64::MAX);
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let threshold = now.saturating_sub(stale_after.max(bucket.window));
            bucket.entries.back().is_some_and(|&ts| ts > threshold)
        });
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, remaining = buckets.len(), "Swept stale fallback buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Number of entries currently held for a key, without pruning
    pub fn entry_count(&self, key: &str) -> usize {
        self.buckets.lock().get(key).map_or(0, |bucket| bucket.entries.len())
    }
}

impl Default for LocalFallbackBucket {
    fn default() -> Self {
        Self::from_settings(&FallbackSettings::default())
    }
}

#[async_trait]
impl CounterStore for LocalFallbackBucket {
    async fn check_and_record(&self, key: &str, rule: &RateLimitRule, now: i64) -> Result<Decision> {
        Ok(self.check(key, rule, now))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let bucket = LocalFallbackBucket::default();
        let rule = RateLimitRule::new(3, 60);

        let remaining: Vec<u64> = (0..3).map(|_| bucket.check("k", &rule, 100).remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = bucket.check("k", &rule, 100);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(60));
        assert_eq!(denied.source, DecisionSource::Fallback);
    }

    #[test]
    fn test_denied_attempts_are_recorded() {
        let bucket = LocalFallbackBucket::default();
        let rule = RateLimitRule::new(1, 10);

        assert!(bucket.check("k", &rule, 0).allowed);
        assert!(!bucket.check("k", &rule, 5).allowed);
        assert_eq!(bucket.entry_count("k"), 2);

        // The allowed entry at t=0 expires at t=10, but the denied one at t=5 is still inside
        assert!(!bucket.check("k", &rule, 10).allowed);
        // Only the t=10 attempt is left in the window at t=19
        assert!(!bucket.check("k", &rule, 19).allowed);
        assert!(bucket.check("k", &rule, 30).allowed);
    }

    #[test]
    fn test_window_slides() {
        let bucket = LocalFallbackBucket::default();
        let rule = RateLimitRule::new(2, 10);

        assert!(bucket.check("k", &rule, 0).allowed);
        assert!(bucket.check("k", &rule, 5).allowed);
        // Entry at t=0 is expired at t=10
        let decision = bucket.check("k", &rule, 10);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let bucket = LocalFallbackBucket::default();
        let rule = RateLimitRule::new(1, 60);

        assert!(bucket.check("a", &rule, 0).allowed);
        assert!(bucket.check("b", &rule, 0).allowed);
        assert!(!bucket.check("a", &rule, 1).allowed);
    }

    #[test]
    fn test_sweep_drops_stale_buckets() {
        let bucket = LocalFallbackBucket::new(Duration::from_secs(3600));
        let rule = RateLimitRule::new(10, 60);

        bucket.check("old", &rule, 0);
        bucket.check("fresh", &rule, 4000);
        assert_eq!(bucket.bucket_count(), 2);

        assert_eq!(bucket.sweep(4000), 1);
        assert_eq!(bucket.bucket_count(), 1);
        assert_eq!(bucket.entry_count("fresh"), 1);
    }

    #[test]
    fn test_sweep_keeps_buckets_inside_long_windows() {
        let bucket = LocalFallbackBucket::new(Duration::from_secs(3600));
        let daily = RateLimitRule::new(1, 7200);

        assert!(bucket.check("k", &daily, 0).allowed);
        assert_eq!(bucket.sweep(3601), 0);
        assert!(!bucket.check("k", &daily, 3602).allowed);

        // Once the newest entry is past both the window and the stale threshold it goes
        assert_eq!(bucket.sweep(3602 + 7200), 1);
        assert_eq!(bucket.bucket_count(), 0);
    }

    #[test]
    fn test_checks_trigger_periodic_sweep() {
        let bucket = LocalFallbackBucket::new(Duration::from_secs(3600));
        let rule = RateLimitRule::new(10, 60);

        bucket.check("stale", &rule, 0);
        for _ in 0..SWEEP_EVERY {
            bucket.check("busy", &rule, 5000);
        }

        assert_eq!(bucket.entry_count("stale"), 0);
        assert_eq!(bucket.bucket_count(), 1);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let bucket = Arc::new(LocalFallbackBucket::default());
        let rule = RateLimitRule::new(50, 60);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || {
                    (0..25).filter(|_| bucket.check("shared", &rule, 100).allowed).count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
