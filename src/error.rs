use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the admission-control subsystem
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store timeout: {0}")]
    Timeout(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl RateLimitError {
    /// Whether this error means the shared counter store could not complete
    /// a transaction. These are recovered by the local fallback; anything else
    /// is an unexpected fault.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::Redis(_) | RateLimitError::Timeout(_) | RateLimitError::StoreUnavailable(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RateLimitError::Redis(_) => "redis",
            RateLimitError::Timeout(_) => "timeout",
            RateLimitError::StoreUnavailable(_) => "unavailable",
            RateLimitError::Config(_) => "config",
            RateLimitError::Internal(_) => "internal",
            RateLimitError::Io(_) => "io",
            RateLimitError::Serialization(_) => "serialization",
            RateLimitError::Yaml(_) => "yaml",
            RateLimitError::Settings(_) => "settings",
            RateLimitError::Metrics(_) => "metrics",
        }
    }
}
