use crate::context::Context;
use crate::error::{message, ConfigError, ContextError, DispatchError};
use crate::rate_limit::{Decision, RateLimiter};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token bucket refilled at `rate` permits per second, holding at most `burst`.
///
/// `acquire` reserves permits up front: the token count may go negative, and the caller sleeps
/// until the debt is repaid. A reservation abandoned because the context ended is returned to
/// the bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ConfigError::InvalidRate(rate));
        }
        if burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        Ok(Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket { tokens: f64::from(burst), updated: Instant::now() }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Tokens available now; negative while reservations are outstanding.
    pub fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(f64::from(self.burst));
        bucket.updated = now;
    }

    fn wait_for_debt(&self, tokens: f64) -> Duration {
        if tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-tokens / self.rate)
        }
    }

    /// Reserve `permits`, returning how long the caller must wait before using them.
    fn reserve(&self, permits: u32, now: Instant) -> Duration {
        let mut bucket = self.lock();
        self.refill(&mut bucket, now);
        bucket.tokens -= f64::from(permits);
        self.wait_for_debt(bucket.tokens)
    }

    fn cancel_reservation(&self, permits: u32) {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens = (bucket.tokens + f64::from(permits)).min(f64::from(self.burst));
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, ctx: &Context, permits: u32) -> Result<(), DispatchError> {
        if permits > self.burst {
            return Err(DispatchError::Permanent(message(format!(
                "requested {permits} permits exceeds burst of {}",
                self.burst
            ))));
        }
        if let Some(reason) = ctx.err() {
            return Err(DispatchError::RateLimited { waited: Duration::ZERO, reason });
        }

        let start = Instant::now();
        let wait = self.reserve(permits, start);
        if wait.is_zero() {
            return Ok(());
        }
        if ctx.deadline().is_some_and(|deadline| start + wait > deadline) {
            self.cancel_reservation(permits);
            tracing::debug!(?wait, "rate limit wait exceeds deadline");
            return Err(DispatchError::RateLimited {
                waited: Duration::ZERO,
                reason: ContextError::DeadlineExceeded,
            });
        }

        tracing::debug!(?wait, permits, "waiting for rate limit");
        tokio::select! {
            biased;
            reason = ctx.done() => {
                self.cancel_reservation(permits);
                Err(DispatchError::RateLimited { waited: start.elapsed(), reason })
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    fn try_acquire(&self, permits: u32) -> Decision {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        let cost = f64::from(permits);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Decision::Allowed { remaining: bucket.tokens.floor() as u32 }
        } else {
            Decision::Denied {
                wait: self.wait_for_debt(bucket.tokens - cost),
                reason: "token_bucket_empty".into(),
            }
        }
    }
}
