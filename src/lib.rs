#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # relaywire
//!
//! Resilient outbound HTTP dispatch: every request runs through a prioritized chain of
//! policies before it reaches the network.
//!
//! ## Features
//!
//! - **Retry** with capped exponential backoff and jitter
//! - **Circuit breaker** with closed, open and half-open states
//! - **Single-flight deduplication** of identical concurrent requests
//! - **Token-bucket rate limiting** honoring request deadlines
//! - **Proxy and cookie rotation** (round-robin or least-recently-used)
//! - **Header injection** and an optional **response cache**
//! - **Live reconfiguration**: policies and rotation pools can be swapped while traffic flows
//!
//! ## Quick Start
//!
//! ```rust
//! use relaywire::{Backoff, CircuitBreaker, Context, Deduplicator, Dispatcher, Jitter, RetryPolicy};
//! use relaywire::testing::ScriptedBackend;
//! use relaywire::Transport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let retry = RetryPolicy::builder()
//!         .max_retries(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(100)))
//!         .with_jitter(Jitter::full())
//!         .build()?;
//!
//!     let dispatcher = Dispatcher::builder()
//!         .transport(Transport::new(ScriptedBackend::new()))
//!         .retry(retry)
//!         .circuit_breaker(CircuitBreaker::default())
//!         .dedup(Deduplicator::new())
//!         .build()?;
//!
//!     let req = http::Request::get("https://api.example.com/items").body(Default::default())?;
//!     let resp = dispatcher.dispatch(&Context::background(), req).await?;
//!     assert!(resp.status().is_success());
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod builder;
pub mod cache;
pub mod chain;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
#[cfg(feature = "config")]
pub mod config;
pub mod context;
pub mod cookie;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod header;
pub mod jitter;
pub mod message;
pub mod prelude;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod rotation;
pub mod sleeper;
pub mod testing;
pub mod transport;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffError};
pub use builder::DispatcherBuilder;
pub use cache::{CacheStore, InMemoryCacheStore, ResponseCache};
pub use chain::{Chain, Middleware, MiddlewareId, Next};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Counts};
pub use client::Dispatcher;
pub use clock::{Clock, ManualClock, MonotonicClock};
#[cfg(feature = "config")]
pub use config::DispatchConfig;
pub use context::{CancelHandle, Context};
pub use cookie::{Cookie, CookieRotation, CookieSet};
pub use dedup::Deduplicator;
pub use error::{ConfigError, ContextError, DispatchError, ErrorKind};
pub use fingerprint::Fingerprint;
pub use header::HeaderInjection;
pub use jitter::Jitter;
pub use message::{Request, Response};
pub use proxy::ProxyRotation;
pub use rate_limit::{Decision, RateLimit, RateLimiter, TokenBucket};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use rotation::{Rotator, Strategy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{Backend, ServiceBackend, Transport, TransportSettings};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestBackend;
