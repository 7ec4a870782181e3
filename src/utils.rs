use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of "now" for window calculations.
///
/// The engine and the fallback bucket only ever see whole Unix seconds, so a
/// manual clock can drive them deterministically in tests.
pub trait TimeSource: Send + Sync {
    /// Current Unix timestamp in seconds
    fn unix_now(&self) -> i64;

    /// Current time as a `DateTime<Utc>`
    fn utc_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.unix_now(), 0).unwrap_or_else(Utc::now)
    }
}

/// Wall clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn unix_now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced time source for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn unix_now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Build the counter key for an (identity, endpoint) pair.
///
/// `identity` is already namespaced (`user:...` or `ip:...`), so two distinct
/// pairs can never collide.
pub fn generate_counter_key(prefix: &str, identity: &str, endpoint: &str) -> String {
    if prefix.is_empty() {
        format!("{}:{}", identity, endpoint)
    } else {
        format!("{}:{}:{}", prefix, identity, endpoint)
    }
}

/// Strip the wildcard suffix from an endpoint pattern.
///
/// Returns `Some(prefix)` for `"/admin/*"` (yielding `"/admin/"`) and `None`
/// for exact patterns.
pub fn wildcard_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*')
}
