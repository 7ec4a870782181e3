//! Gatekeeper Rate Limit
//!
//! Distributed admission control for HTTP services: tiered sliding-window
//! quotas kept in Redis, with an in-process fallback that keeps requests
//! flowing when the shared store is degraded or unreachable.

pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod service;
pub mod utils;

// Re-export main types
pub use crate::cache::{CounterStore, Decision, DecisionSource};
pub use crate::config::{CompiledPolicy, RateLimitRule, RateLimitSettings, Tier};
pub use crate::error::{RateLimitError, Result};
pub use crate::limiter::{AdmissionControl, AdmissionEngine, StoreHealth};
pub use crate::middleware::{gatekeeper, GatekeeperState};
pub use crate::service::RateLimitService;
