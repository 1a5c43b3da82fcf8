//! Admission control.
//!
//! - [`RateLimiter`]: the limiter contract, async so implementations may wait.
//! - [`TokenBucket`]: in-process token bucket with reservation semantics.
//! - [`RateLimit`]: the chain policy that acquires a permit before every request.
//!
//! A request that cannot be admitted before its context ends fails with
//! [`DispatchError::RateLimited`]. When the context has a deadline the limiter fails fast:
//! if the required wait would end past the deadline it rejects immediately instead of waiting.

use crate::context::Context;
use crate::error::DispatchError;
use async_trait::async_trait;
use std::time::Duration;

pub mod middleware;
pub mod strategies;

pub use middleware::RateLimit;
pub use strategies::TokenBucket;

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed {
        /// Whole permits left after this acquisition.
        remaining: u32,
    },
    Denied {
        /// How long until enough permits accumulate.
        wait: Duration,
        reason: String,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Rate limiting logic, decoupled from the chain policy that enforces it.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Wait until `permits` are available or `ctx` ends.
    async fn acquire(&self, ctx: &Context, permits: u32) -> Result<(), DispatchError>;

    /// Take `permits` only if available right now.
    fn try_acquire(&self, permits: u32) -> Decision;
}
