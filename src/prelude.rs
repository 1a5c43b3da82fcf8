//! Convenient re-exports for common relaywire types.
pub use crate::{
    backoff::Backoff,
    builder::{priority, DispatcherBuilder},
    chain::{Chain, Middleware, MiddlewareId, Next},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    client::Dispatcher,
    context::Context,
    cookie::{Cookie, CookieRotation, CookieSet},
    dedup::Deduplicator,
    error::{ConfigError, DispatchError, ErrorKind},
    header::HeaderInjection,
    jitter::Jitter,
    message::{Request, Response},
    proxy::ProxyRotation,
    rate_limit::{RateLimit, TokenBucket},
    retry::RetryPolicy,
    rotation::Strategy,
    transport::Transport,
};
