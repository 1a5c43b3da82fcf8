use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::rate_limit::{RateLimiter, TokenBucket};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;

/// Chain policy that acquires permits from a [`RateLimiter`] before each request.
///
/// Clones share the limiter.
#[derive(Debug, Clone)]
pub struct RateLimit<L = TokenBucket> {
    limiter: Arc<L>,
    permits: u32,
}

impl<L> RateLimit<L> {
    /// One permit per request.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter), permits: 1 }
    }

    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter, permits: 1 }
    }

    /// Charge `permits` per request instead of one.
    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

#[async_trait]
impl<L> Middleware for RateLimit<L>
where
    L: RateLimiter + 'static,
{
    fn id(&self) -> MiddlewareId {
        MiddlewareId::RATE_LIMIT
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        self.limiter.acquire(ctx, self.permits).await?;
        next.run(ctx, transport, req).await
    }
}
