//! Assembling a [`Dispatcher`] from the built-in policies.

use crate::cache::ResponseCache;
use crate::chain::{Chain, Middleware};
use crate::circuit_breaker::CircuitBreaker;
use crate::client::Dispatcher;
use crate::cookie::CookieRotation;
use crate::dedup::Deduplicator;
use crate::error::ConfigError;
use crate::header::HeaderInjection;
use crate::proxy::ProxyRotation;
use crate::rate_limit::RateLimit;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Default chain positions. Higher runs first (further from the transport).
pub mod priority {
    pub const RETRY: i32 = 60;
    pub const DEDUP: i32 = 55;
    pub const CIRCUIT_BREAKER: i32 = 50;
    pub const CACHE: i32 = 35;
    pub const RATE_LIMIT: i32 = 30;
    pub const HEADER: i32 = 20;
    pub const COOKIE: i32 = 15;
    pub const PROXY: i32 = 10;
}

/// Builder for [`Dispatcher`].
///
/// Every policy is optional; the ones supplied are placed at their [`priority`] positions, so
/// a retry wraps coalescing, coalescing wraps the breaker, and so on down to the proxy
/// selection right before the transport. Coalescing sits outside the breaker so a shared
/// upstream call is recorded once, however many callers joined it.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    transport: Option<Transport>,
    timeout: Option<Duration>,
    layers: Vec<(i32, Arc<dyn Middleware>)>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Per-request transport timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.layer(priority::RETRY, policy)
    }

    pub fn circuit_breaker(self, breaker: CircuitBreaker) -> Self {
        self.layer(priority::CIRCUIT_BREAKER, breaker)
    }

    pub fn dedup(self, dedup: Deduplicator) -> Self {
        self.layer(priority::DEDUP, dedup)
    }

    pub fn cache<S>(self, cache: ResponseCache<S>) -> Self
    where
        ResponseCache<S>: Middleware + 'static,
    {
        self.layer(priority::CACHE, cache)
    }

    pub fn rate_limit<L>(self, limit: RateLimit<L>) -> Self
    where
        RateLimit<L>: Middleware + 'static,
    {
        self.layer(priority::RATE_LIMIT, limit)
    }

    pub fn headers(self, headers: HeaderInjection) -> Self {
        self.layer(priority::HEADER, headers)
    }

    pub fn cookies(self, cookies: CookieRotation) -> Self {
        self.layer(priority::COOKIE, cookies)
    }

    pub fn proxies(self, proxies: ProxyRotation) -> Self {
        self.layer(priority::PROXY, proxies)
    }

    /// Add any policy at an explicit priority. A later policy with the same identity replaces
    /// an earlier one.
    pub fn layer<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layers.push((priority, Arc::new(middleware)));
        self
    }

    /// Without an explicit transport the reqwest backend is used when that feature is enabled.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let transport = match self.timeout {
            Some(timeout) => transport.with_timeout(timeout),
            None => transport,
        };
        let chain = Chain::new();
        for (priority, middleware) in self.layers {
            chain.add_all(priority, [middleware]);
        }
        tracing::debug!(policies = chain.count(), "dispatcher built");
        Ok(Dispatcher::new(chain, transport))
    }
}

#[cfg(feature = "reqwest")]
fn default_transport() -> Result<Transport, ConfigError> {
    Ok(Transport::reqwest())
}

#[cfg(not(feature = "reqwest"))]
fn default_transport() -> Result<Transport, ConfigError> {
    Err(ConfigError::MissingTransport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MiddlewareId;
    use crate::rate_limit::TokenBucket;
    use crate::testing::ScriptedBackend;

    #[test]
    fn policies_land_in_default_order() {
        let dispatcher = DispatcherBuilder::new()
            .transport(Transport::new(ScriptedBackend::new()))
            .proxies(ProxyRotation::new(Vec::new()))
            .headers(HeaderInjection::default())
            .rate_limit(RateLimit::new(TokenBucket::new(10.0, 10).unwrap()))
            .dedup(Deduplicator::new())
            .retry(RetryPolicy::builder().build().unwrap())
            .cookies(CookieRotation::new(Vec::new()))
            .cache(ResponseCache::in_memory(Duration::from_secs(1)))
            .circuit_breaker(CircuitBreaker::default())
            .build()
            .unwrap();

        let ids: Vec<MiddlewareId> = dispatcher.chain().entries().iter().map(|e| e.id()).collect();
        assert_eq!(
            ids,
            vec![
                MiddlewareId::RETRY,
                MiddlewareId::DEDUP,
                MiddlewareId::CIRCUIT_BREAKER,
                MiddlewareId::CACHE,
                MiddlewareId::RATE_LIMIT,
                MiddlewareId::HEADER,
                MiddlewareId::COOKIE,
                MiddlewareId::PROXY,
            ]
        );
    }

    #[test]
    fn repeated_policy_replaces_the_earlier_one() {
        let dispatcher = DispatcherBuilder::new()
            .transport(Transport::new(ScriptedBackend::new()))
            .retry(RetryPolicy::builder().max_retries(1).build().unwrap())
            .retry(RetryPolicy::builder().max_retries(5).build().unwrap())
            .build()
            .unwrap();
        assert_eq!(dispatcher.chain().count(), 1);
    }

    #[test]
    fn timeout_applies_to_the_transport() {
        let dispatcher = DispatcherBuilder::new()
            .transport(Transport::new(ScriptedBackend::new()))
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(dispatcher.transport().settings().timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn custom_layers_use_their_own_priority() {
        let dispatcher = DispatcherBuilder::new()
            .transport(Transport::new(ScriptedBackend::new()))
            .retry(RetryPolicy::builder().build().unwrap())
            .layer(100, HeaderInjection::default())
            .build()
            .unwrap();
        let first = dispatcher.chain().entries()[0].clone();
        assert_eq!(first.id(), MiddlewareId::HEADER);
        assert_eq!(first.priority(), 100);
    }
}
