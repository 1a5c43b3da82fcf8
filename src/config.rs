//! Declarative dispatcher configuration.
//!
//! Durations are whole milliseconds. Absent sections leave the matching policy out of the chain.
//!
//! ```
//! let config = relaywire::config::DispatchConfig::from_json(r#"{
//!     "timeout_ms": 10000,
//!     "retry": { "max_retries": 2, "initial_interval_ms": 200 },
//!     "circuit_breaker": { "open_timeout_ms": 30000 },
//!     "rate_limit": { "rate": 5.0, "burst": 10 },
//!     "dedup": true,
//!     "headers": { "user-agent": "relaywire" },
//!     "proxies": ["http://10.0.0.1:3128"]
//! }"#).unwrap();
//! assert_eq!(config.proxies.len(), 1);
//! ```

use crate::backoff::Backoff;
use crate::builder::DispatcherBuilder;
use crate::cache::ResponseCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cookie::{Cookie, CookieRotation, CookieSet};
use crate::dedup::Deduplicator;
use crate::error::ConfigError;
use crate::header::HeaderInjection;
use crate::jitter::Jitter;
use crate::proxy::ProxyRotation;
use crate::rate_limit::{RateLimit, TokenBucket};
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL, DEFAULT_MAX_RETRIES};
use crate::rotation::Strategy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<BreakerConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub dedup: bool,
    pub cache_ttl_ms: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub proxies: Vec<Url>,
    pub proxy_strategy: Strategy,
    pub cookies: Vec<Vec<Cookie>>,
    pub cookie_strategy: Strategy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: Option<u64>,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_interval_ms: millis(DEFAULT_INITIAL_INTERVAL),
            max_interval_ms: millis(DEFAULT_MAX_INTERVAL),
            max_elapsed_ms: None,
            jitter: Jitter::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub max_half_open: u32,
    pub interval_ms: u64,
    pub open_timeout_ms: u64,
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            max_half_open: defaults.max_half_open(),
            interval_ms: millis(defaults.interval()),
            open_timeout_ms: millis(defaults.open_timeout()),
            min_requests: defaults.min_requests(),
            failure_ratio: defaults.failure_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Tokens per second.
    pub rate: f64,
    pub burst: u32,
    #[serde(default = "one")]
    pub permits: u32,
}

fn one() -> u32 {
    1
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl DispatchConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every section and place the configured policies on a builder.
    ///
    /// The transport is left to the builder's default unless set on the result.
    pub fn into_builder(self) -> Result<DispatcherBuilder, ConfigError> {
        let mut builder = DispatcherBuilder::new();
        if let Some(timeout) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        if let Some(retry) = self.retry {
            builder = builder.retry(retry.build()?);
        }
        if let Some(breaker) = self.circuit_breaker {
            builder = builder.circuit_breaker(breaker.build()?);
        }
        if self.dedup {
            builder = builder.dedup(Deduplicator::new());
        }
        if let Some(ttl) = self.cache_ttl_ms {
            if ttl == 0 {
                return Err(ConfigError::MustBePositive { field: "cache_ttl_ms" });
            }
            builder = builder.cache(ResponseCache::in_memory(Duration::from_millis(ttl)));
        }
        if let Some(limit) = self.rate_limit {
            let bucket = TokenBucket::new(limit.rate, limit.burst)?;
            builder = builder.rate_limit(RateLimit::new(bucket).with_permits(limit.permits));
        }
        if !self.headers.is_empty() {
            builder = builder.headers(HeaderInjection::from_pairs(&self.headers)?);
        }
        if !self.cookies.is_empty() {
            let sets = self
                .cookies
                .into_iter()
                .map(CookieSet::new)
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.cookies(CookieRotation::with_strategy(sets, self.cookie_strategy));
        }
        if !self.proxies.is_empty() {
            builder =
                builder.proxies(ProxyRotation::with_strategy(self.proxies, self.proxy_strategy));
        }
        Ok(builder)
    }
}

impl RetryConfig {
    pub fn build(&self) -> Result<RetryPolicy, ConfigError> {
        let backoff = Backoff::exponential(Duration::from_millis(self.initial_interval_ms))
            .with_max(Duration::from_millis(self.max_interval_ms))?;
        let mut builder = RetryPolicy::builder()
            .max_retries(self.max_retries)
            .backoff(backoff)
            .with_jitter(self.jitter);
        if let Some(budget) = self.max_elapsed_ms {
            builder = builder.max_elapsed(Duration::from_millis(budget));
        }
        builder.build()
    }
}

impl BreakerConfig {
    pub fn build(&self) -> Result<CircuitBreaker, ConfigError> {
        let config = CircuitBreakerConfig::new(
            self.max_half_open,
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.open_timeout_ms),
        )?
        .with_trip(self.min_requests, self.failure_ratio)?;
        Ok(CircuitBreaker::new(config))
    }
}
