//! Rate limit configuration.
//!
//! A request is matched against, in order of precedence:
//! 1. the first endpoint pattern contained in the request path
//! 2. a per-HTTP-method config
//! 3. the default config

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Traffic shaping algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Counter reset when the window expires
    FixedWindow,
    /// Sum over time-quantized sub-buckets
    #[default]
    SlidingWindow,
    /// Continuous refill at `limit / window` tokens per second
    TokenBucket,
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitStrategy::FixedWindow => write!(f, "fixed_window"),
            RateLimitStrategy::SlidingWindow => write!(f, "sliding_window"),
            RateLimitStrategy::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

impl FromStr for RateLimitStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed_window" | "fixed" => Ok(RateLimitStrategy::FixedWindow),
            "sliding_window" | "sliding" => Ok(RateLimitStrategy::SlidingWindow),
            "token_bucket" | "token" => Ok(RateLimitStrategy::TokenBucket),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Limit applied to one (client, endpoint) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
    pub strategy: RateLimitStrategy,
    /// Sub-buckets per window for the sliding window strategy
    pub bucket_count: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: 60,
            strategy: RateLimitStrategy::SlidingWindow,
            bucket_count: 6,
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u64, window: u64, strategy: RateLimitStrategy) -> Self {
        Self {
            limit,
            window,
            strategy,
            ..Default::default()
        }
    }

    pub fn with_bucket_count(mut self, bucket_count: u64) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::InvalidLimit);
        }
        if self.window == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        if self.bucket_count == 0 {
            return Err(ConfigError::InvalidBucketCount(self.bucket_count));
        }
        Ok(())
    }
}

/// Config bound to paths containing `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub pattern: String,
    pub config: RateLimitConfig,
}

/// Middleware configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Disable to pass every request through untouched
    pub enabled: bool,
    pub default: RateLimitConfig,
    /// Checked in order, first match wins
    pub endpoints: Vec<EndpointLimit>,
    /// Keyed by upper-case HTTP method
    pub methods: HashMap<String, RateLimitConfig>,
    /// Path prefixes never rate limited
    pub excluded_paths: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateLimitConfig::default(),
            endpoints: Vec::new(),
            methods: HashMap::new(),
            excluded_paths: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/docs".to_string(),
                "/openapi.json".to_string(),
            ],
        }
    }
}

impl MiddlewareConfig {
    /// Read the default limit from the environment.
    ///
    /// - `RATE_LIMIT_ENABLED`: `false`/`0` disables limiting (default: true)
    /// - `RATE_LIMIT_DEFAULT_LIMIT`: requests per window (default: 100)
    /// - `RATE_LIMIT_DEFAULT_WINDOW`: window in seconds (default: 60)
    /// - `RATE_LIMIT_STRATEGY`: `fixed_window`, `sliding_window` or `token_bucket`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = env::var("RATE_LIMIT_ENABLED") {
            config.enabled = v.to_lowercase() != "false" && v != "0";
        }
        if let Ok(v) = env::var("RATE_LIMIT_DEFAULT_LIMIT") {
            config.default.limit = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("RATE_LIMIT_DEFAULT_LIMIT", v))?;
        }
        if let Ok(v) = env::var("RATE_LIMIT_DEFAULT_WINDOW") {
            config.default.window = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("RATE_LIMIT_DEFAULT_WINDOW", v))?;
        }
        if let Ok(v) = env::var("RATE_LIMIT_STRATEGY") {
            config.default.strategy = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_endpoint(mut self, pattern: impl Into<String>, config: RateLimitConfig) -> Self {
        self.endpoints.push(EndpointLimit {
            pattern: pattern.into(),
            config,
        });
        self
    }

    pub fn with_method(mut self, method: &str, config: RateLimitConfig) -> Self {
        self.methods.insert(method.to_uppercase(), config);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate()?;
        for endpoint in &self.endpoints {
            endpoint.config.validate()?;
        }
        for config in self.methods.values() {
            config.validate()?;
        }
        Ok(())
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Most specific config for a request.
    pub fn select(&self, method: &str, path: &str) -> &RateLimitConfig {
        if let Some(endpoint) = self
            .endpoints
            .iter()
            .find(|e| path.contains(e.pattern.as_str()))
        {
            return &endpoint.config;
        }
        self.methods.get(method).unwrap_or(&self.default)
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("limit must be greater than zero")]
    InvalidLimit,

    #[error("window must be at least one second")]
    InvalidWindow,

    #[error("bucket_count must be greater than zero, got {0}")]
    InvalidBucketCount(u64),

    #[error("unknown rate limit strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid value for {0}: '{1}'")]
    InvalidEnv(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit, 100);
        assert_eq!(config.window, 60);
        assert_eq!(config.strategy, RateLimitStrategy::SlidingWindow);
        assert_eq!(config.bucket_count, 6);

        let mw = MiddlewareConfig::default();
        assert!(mw.is_excluded("/health"));
        assert!(mw.is_excluded("/docs/index.html"));
        assert!(!mw.is_excluded("/api/quests"));
    }

    #[test]
    fn test_select_precedence() {
        let login = RateLimitConfig::new(5, 60, RateLimitStrategy::FixedWindow);
        let writes = RateLimitConfig::new(20, 60, RateLimitStrategy::TokenBucket);
        let config = MiddlewareConfig::default()
            .with_endpoint("/auth/login", login)
            .with_method("post", writes);

        assert_eq!(config.select("POST", "/auth/login"), &login);
        assert_eq!(config.select("POST", "/quests"), &writes);
        assert_eq!(config.select("GET", "/quests"), &config.default);
    }

    #[test]
    fn test_first_endpoint_match_wins() {
        let a = RateLimitConfig::new(1, 10, RateLimitStrategy::FixedWindow);
        let b = RateLimitConfig::new(2, 10, RateLimitStrategy::FixedWindow);
        let config = MiddlewareConfig::default()
            .with_endpoint("/users", a)
            .with_endpoint("/users/me", b);
        assert_eq!(config.select("GET", "/users/me").limit, 1);
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            RateLimitConfig::new(0, 60, RateLimitStrategy::FixedWindow).validate(),
            Err(ConfigError::InvalidLimit)
        );
        assert_eq!(
            RateLimitConfig::new(10, 0, RateLimitStrategy::FixedWindow).validate(),
            Err(ConfigError::InvalidWindow)
        );
        assert_eq!(
            RateLimitConfig::default().with_bucket_count(0).validate(),
            Err(ConfigError::InvalidBucketCount(0))
        );
    }

    #[test]
    fn test_strategy_parse_and_serde() {
        assert_eq!(
            "token_bucket".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::TokenBucket
        );
        assert!("leaky".parse::<RateLimitStrategy>().is_err());

        let json = serde_json::to_string(&RateLimitStrategy::FixedWindow).unwrap();
        assert_eq!(json, "\"fixed_window\"");

        let config: RateLimitConfig =
            serde_json::from_str(r#"{"limit": 10, "strategy": "token_bucket"}"#).unwrap();
        assert_eq!(config.limit, 10);
        assert_eq!(config.window, 60);
        assert_eq!(config.strategy, RateLimitStrategy::TokenBucket);
    }
}
