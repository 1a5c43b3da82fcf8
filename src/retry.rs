//! Retry with capped exponential backoff.
//!
//! Semantics:
//! - `max_retries = M` allows at most `M + 1` calls to the rest of the chain.
//! - A response with a temporary status (5xx, 429) counts as a failure; any other response is
//!   returned to the caller unchanged, 4xx included.
//! - Only temporary errors are retried. Permanent errors and cancellations return at once.
//! - The wait before retry `n` (zero-based) is `min(initial * 2^n, max)` with jitter applied.
//! - An optional `max_elapsed` budget stops retrying when the next wait would overrun it.
//!
//! Invariants:
//! - Exhaustion yields [`DispatchError::RetryExhausted`] carrying the attempt count and the last
//!   failure.
//! - If the context ends during a wait, the wait is abandoned and
//!   [`DispatchError::Canceled`] is returned, wrapping the last failure.
//!
//! ```rust
//! use std::time::Duration;
//! use relaywire::{Backoff, Jitter, RetryPolicy};
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(2)).unwrap())
//!     .with_jitter(Jitter::equal())
//!     .build()
//!     .unwrap();
//! assert_eq!(policy.max_retries(), 3);
//! ```

use crate::backoff::Backoff;
use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::{classify_status, ConfigError, DispatchError, StatusClass};
use crate::jitter::Jitter;
use crate::message::{clone_request, Request, Response};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::transport::Transport;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Retry policy combining backoff, jitter, an elapsed-time budget, and a sleeper.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Backoff,
    jitter: Jitter,
    max_elapsed: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

/// Progress of one retried request.
#[derive(Debug)]
struct RetryState {
    retries: usize,
    deadline: Option<Instant>,
}

impl RetryState {
    fn new(max_elapsed: Option<Duration>) -> Self {
        Self { retries: 0, deadline: max_elapsed.map(|budget| Instant::now() + budget) }
    }

    fn attempts(&self) -> usize {
        self.retries + 1
    }

    fn would_overrun(&self, wait: Duration) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() + wait > deadline)
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Exponential policy from `initial` doubling up to `max`.
    pub fn new(max_retries: usize, initial: Duration, max: Duration) -> Result<Self, ConfigError> {
        Self::builder()
            .max_retries(max_retries)
            .backoff(Backoff::exponential(initial).with_max(max)?)
            .build()
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<Op, Fut>(
        &self,
        ctx: &Context,
        mut operation: Op,
    ) -> Result<Response, DispatchError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<Response, DispatchError>>,
    {
        let mut state = RetryState::new(self.max_elapsed);
        loop {
            let failure = match operation().await {
                Ok(resp) if classify_status(resp.status()) == StatusClass::Temporary => {
                    DispatchError::bad_status(resp)
                }
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            if !failure.is_temporary() {
                return Err(failure);
            }

            let wait = self.jitter.apply(self.backoff.delay(state.retries));
            if state.retries >= self.max_retries || state.would_overrun(wait) {
                tracing::warn!(attempts = state.attempts(), error = %failure, "retries exhausted");
                return Err(DispatchError::RetryExhausted {
                    attempts: state.attempts(),
                    last: Box::new(failure),
                });
            }

            tracing::warn!(
                attempt = state.attempts(),
                retry_in = ?wait,
                error = %failure,
                "request failed, retrying"
            );
            tokio::select! {
                biased;
                reason = ctx.done() => {
                    return Err(DispatchError::Canceled { reason, last: Some(Box::new(failure)) });
                }
                _ = self.sleeper.sleep(wait) => {}
            }
            state.retries += 1;
        }
    }
}

#[async_trait]
impl Middleware for RetryPolicy {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::RETRY
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        self.execute(ctx, || next.run(ctx, transport, clone_request(&req))).await
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    backoff: Backoff,
    jitter: Jitter,
    max_elapsed: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::exponential(DEFAULT_INITIAL_INTERVAL),
            jitter: Jitter::full(),
            max_elapsed: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Retries after the first call; zero disables retrying.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop retrying once the next wait would end past this budget.
    pub fn max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        if self.max_elapsed.is_some_and(|budget| budget.is_zero()) {
            return Err(ConfigError::MustBePositive { field: "max_elapsed" });
        }
        let backoff = match self.backoff.max() {
            Some(_) => self.backoff,
            None => self.backoff.with_max(DEFAULT_MAX_INTERVAL.max(self.backoff.delay(0)))?,
        };
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff,
            jitter: self.jitter,
            max_elapsed: self.max_elapsed,
            sleeper: self.sleeper,
        })
    }
}
