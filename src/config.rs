use serde::{Deserialize, Serialize};
use std::{collections::{HashMap, HashSet}, fmt, str::FromStr};
use crate::{error::{RateLimitError, Result}, utils::wildcard_prefix};

/// A quota: at most `requests_allowed` requests per sliding `window_seconds`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub requests_allowed: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub const fn new(requests_allowed: u32, window_seconds: u64) -> Self {
        Self {
            requests_allowed,
            window_seconds,
        }
    }

    /// Both fields must be strictly positive
    pub fn validate(&self) -> Result<()> {
        if self.requests_allowed == 0 {
            return Err(RateLimitError::Config(
                "requests_allowed must be greater than zero".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(RateLimitError::Config(
                "window_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Caller classification used to select a default quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Public,
    Authenticated,
    Premium,
    Admin,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Public => "public",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Tier::Public),
            "authenticated" => Ok(Tier::Authenticated),
            "premium" => Ok(Tier::Premium),
            "admin" => Ok(Tier::Admin),
            other => Err(RateLimitError::Config(format!("Unknown tier: {}", other))),
        }
    }
}

/// Default rule for every tier. A struct rather than a map so that no tier
/// can be left unconfigured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierDefaults {
    pub public: RateLimitRule,
    pub authenticated: RateLimitRule,
    pub premium: RateLimitRule,
    pub admin: RateLimitRule,
}

impl Default for TierDefaults {
    fn default() -> Self {
        Self {
            public: RateLimitRule::new(60, 60),
            authenticated: RateLimitRule::new(300, 60),
            premium: RateLimitRule::new(1000, 60),
            admin: RateLimitRule::new(10000, 60),
        }
    }
}

impl TierDefaults {
    pub fn rule_for(&self, tier: Tier) -> RateLimitRule {
        match tier {
            Tier::Public => self.public,
            Tier::Authenticated => self.authenticated,
            Tier::Premium => self.premium,
            Tier::Admin => self.admin,
        }
    }
}

/// Endpoint-specific rule superseding the tier default.
///
/// `pattern` is either an exact path or a prefix ending in `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    pub pattern: String,
    pub requests_allowed: u32,
    pub window_seconds: u64,
}

impl EndpointOverride {
    pub fn rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.requests_allowed, self.window_seconds)
    }
}

/// Connection settings for the shared counter store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 2000,
            command_timeout_ms: 2000,
        }
    }
}

/// Local fallback bucket maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Buckets with no entry newer than this are dropped by the sweep
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// How callers are identified by the default extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub token_prefix_len: usize,
    pub trust_forwarded_headers: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            token_prefix_len: 16,
            trust_forwarded_headers: true,
        }
    }
}

/// Full configuration surface of the gatekeeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub include_headers: bool,
    pub key_prefix: String,
    pub tier_defaults: TierDefaults,
    pub endpoint_overrides: Vec<EndpointOverride>,
    pub exempt_paths: Vec<String>,
    pub redis: RedisSettings,
    pub fallback: FallbackSettings,
    pub health_probe_interval_secs: u64,
    pub identity: IdentitySettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            include_headers: true,
            key_prefix: "ratelimit".to_string(),
            tier_defaults: TierDefaults::default(),
            endpoint_overrides: Vec::new(),
            exempt_paths: ["/health", "/healthcheck", "/metrics", "/docs", "/redoc", "/openapi.json"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            redis: RedisSettings::default(),
            fallback: FallbackSettings::default(),
            health_probe_interval_secs: 10,
            identity: IdentitySettings::default(),
        }
    }
}

/// Immutable policy snapshot compiled from settings for fast lookups
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    enabled: bool,
    tier_defaults: TierDefaults,
    exact: HashMap<String, RateLimitRule>,
    // Sorted longest prefix first
    wildcards: Vec<(String, RateLimitRule)>,
    exempt: HashSet<String>,
}

impl CompiledPolicy {
    /// Validate and compile settings. Any invalid rule is a startup error.
    pub fn compile(settings: &RateLimitSettings) -> Result<Self> {
        let tiers = &settings.tier_defaults;
        for tier in [Tier::Public, Tier::Authenticated, Tier::Premium, Tier::Admin] {
            tiers.rule_for(tier).validate().map_err(|e| {
                RateLimitError::Config(format!("tier '{}': {}", tier, e))
            })?;
        }

        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for over in &settings.endpoint_overrides {
            if over.pattern.is_empty() {
                return Err(RateLimitError::Config(
                    "endpoint override pattern must not be empty".to_string(),
                ));
            }
            let rule = over.rule();
            rule.validate().map_err(|e| {
                RateLimitError::Config(format!("override '{}': {}", over.pattern, e))
            })?;

            match wildcard_prefix(&over.pattern) {
                Some(prefix) => wildcards.push((prefix.to_string(), rule)),
                None => {
                    exact.insert(over.pattern.clone(), rule);
                }
            }
        }

        // Longest prefix first; ties broken lexically so the order is deterministic
        wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        wildcards.dedup_by(|a, b| a.0 == b.0);

        Ok(Self {
            enabled: settings.enabled,
            tier_defaults: settings.tier_defaults.clone(),
            exact,
            wildcards,
            exempt: settings.exempt_paths.iter().cloned().collect(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve the rule for a request: exact override, then longest wildcard
    /// prefix, then the tier default.
    pub fn resolve_rule(&self, endpoint: &str, tier: Tier) -> RateLimitRule {
        if let Some(rule) = self.exact.get(endpoint) {
            return *rule;
        }

        self.wildcards
            .iter()
            .find(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
            .map(|(_, rule)| *rule)
            .unwrap_or_else(|| self.tier_defaults.rule_for(tier))
    }

    pub fn is_exempt(&self, endpoint: &str) -> bool {
        self.exempt.contains(endpoint)
    }
}

/// Load settings from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitSettings> {
    serde_yaml::from_str(yaml).map_err(|e| {
        RateLimitError::Config(format!("Failed to parse YAML: {}", e))
    })
}

/// Load settings from YAML file
pub fn load_config_from_file(path: &str) -> Result<RateLimitSettings> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load settings from an optional file layered under `RATELIMIT__*`
/// environment overrides (e.g. `RATELIMIT__REDIS__URL`).
pub fn load_settings(path: Option<&str>) -> Result<RateLimitSettings> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix("RATELIMIT")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;
    Ok(settings)
}
