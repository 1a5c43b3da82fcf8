//! Circuit breaker with generation-scoped counts.
//!
//! Semantics:
//! - **Closed**: requests pass and outcomes are counted. Counts reset every `interval` (when
//!   non-zero) and on every state change. The breaker trips when at least `min_requests` were
//!   seen and the failure ratio reaches `failure_ratio`.
//! - **Open**: requests fail fast with [`DispatchError::CircuitOpen`] until `open_timeout`
//!   elapses, then the breaker moves to half-open.
//! - **HalfOpen**: up to `max_half_open` probe requests are admitted; further ones fail with
//!   [`DispatchError::CircuitExhausted`]. `max_half_open` consecutive successes close the
//!   breaker; any failure reopens it.
//!
//! Each state change starts a new generation. An outcome reported for an older generation is
//! ignored, so a slow call that started before a transition cannot skew the new counts.
//!
//! Outcomes: a response with a temporary status (5xx, 429) is a failure and any other response a
//! success. Rate-limit rejections, explicit cancellation, and futures dropped before completion
//! are neutral: they release their admission slot without affecting the counts.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::clock::{Clock, MonotonicClock};
use crate::context::Context;
use crate::error::{classify_status, ConfigError, ContextError, DispatchError, StatusClass};
use crate::message::{Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Request and outcome tallies for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Failures over requests; zero before any request.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Validated breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    max_half_open: u32,
    interval: Duration,
    open_timeout: Duration,
    min_requests: u32,
    failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_half_open: 1,
            interval: Duration::ZERO,
            open_timeout: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

impl CircuitBreakerConfig {
    /// `interval` of zero keeps closed-state counts until the next state change.
    pub fn new(
        max_half_open: u32,
        interval: Duration,
        open_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_half_open == 0 {
            return Err(ConfigError::MustBePositive { field: "max_half_open" });
        }
        if open_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "open_timeout" });
        }
        Ok(Self { max_half_open, interval, open_timeout, ..Self::default() })
    }

    /// Trip once `min_requests` were seen and the failure ratio reaches `failure_ratio`.
    pub fn with_trip(mut self, min_requests: u32, failure_ratio: f64) -> Result<Self, ConfigError> {
        if min_requests == 0 {
            return Err(ConfigError::MustBePositive { field: "min_requests" });
        }
        if !(failure_ratio > 0.0 && failure_ratio <= 1.0) {
            return Err(ConfigError::InvalidFailureRatio(failure_ratio));
        }
        self.min_requests = min_requests;
        self.failure_ratio = failure_ratio;
        Ok(self)
    }

    pub fn max_half_open(&self) -> u32 {
        self.max_half_open
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    pub fn min_requests(&self) -> u32 {
        self.min_requests
    }

    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    Neutral,
}

fn verdict(result: &Result<Response, DispatchError>) -> Verdict {
    match result {
        Ok(resp) if classify_status(resp.status()) == StatusClass::Temporary => Verdict::Failure,
        Ok(_) => Verdict::Success,
        Err(
            DispatchError::RateLimited { .. }
            | DispatchError::CircuitOpen { .. }
            | DispatchError::CircuitExhausted { .. }
            | DispatchError::Canceled { reason: ContextError::Canceled, .. },
        ) => Verdict::Neutral,
        Err(_) => Verdict::Failure,
    }
}

#[derive(Debug)]
struct Machine {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<u64>,
    opened_at: u64,
    tripped_with: u32,
}

/// Circuit breaker guarding the rest of the chain. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    machine: Arc<Mutex<Machine>>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let machine = Self::fresh_machine(&config, clock.now_millis());
        Self { config, machine: Arc::new(Mutex::new(machine)), clock }
    }

    /// Replace the clock; resets the breaker to a fresh closed state.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.machine = Arc::new(Mutex::new(Self::fresh_machine(&self.config, self.clock.now_millis())));
        self
    }

    fn fresh_machine(config: &CircuitBreakerConfig, now: u64) -> Machine {
        let expiry =
            (!config.interval.is_zero()).then(|| now.saturating_add(millis(config.interval)));
        Machine {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry,
            opened_at: 0,
            tripped_with: 0,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// State as of now, applying any due timeout transition.
    pub fn state(&self) -> CircuitState {
        let mut machine = self.lock();
        self.advance(&mut machine, self.clock.now_millis());
        machine.state
    }

    /// Counts of the current generation.
    pub fn counts(&self) -> Counts {
        let mut machine = self.lock();
        self.advance(&mut machine, self.clock.now_millis());
        machine.counts
    }

    /// Run `operation` if the breaker admits it, recording its outcome.
    pub async fn execute<Fut>(&self, operation: Fut) -> Result<Response, DispatchError>
    where
        Fut: Future<Output = Result<Response, DispatchError>>,
    {
        let generation = self.before_call()?;
        let mut guard = CallGuard { breaker: self, generation, settled: false };
        let result = operation.await;
        guard.settled = true;
        self.after_call(generation, verdict(&result));
        result
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_call(&self) -> Result<u64, DispatchError> {
        let mut machine = self.lock();
        let now = self.clock.now_millis();
        self.advance(&mut machine, now);

        match machine.state {
            CircuitState::Open => {
                let open_for = Duration::from_millis(now.saturating_sub(machine.opened_at));
                tracing::debug!(?open_for, "circuit breaker rejected request");
                return Err(DispatchError::CircuitOpen { failures: machine.tripped_with, open_for });
            }
            CircuitState::HalfOpen if machine.counts.requests >= self.config.max_half_open => {
                tracing::debug!(
                    in_flight = machine.counts.requests,
                    max = self.config.max_half_open,
                    "circuit breaker probe limit reached"
                );
                return Err(DispatchError::CircuitExhausted {
                    in_flight: machine.counts.requests,
                    max: self.config.max_half_open,
                });
            }
            _ => {}
        }
        machine.counts.on_request();
        Ok(machine.generation)
    }

    fn after_call(&self, generation: u64, verdict: Verdict) {
        let mut machine = self.lock();
        let now = self.clock.now_millis();
        self.advance(&mut machine, now);
        if machine.generation != generation {
            return;
        }

        match verdict {
            Verdict::Neutral => {
                machine.counts.requests = machine.counts.requests.saturating_sub(1);
            }
            Verdict::Success => {
                machine.counts.on_success();
                if machine.state == CircuitState::HalfOpen
                    && machine.counts.consecutive_successes >= self.config.max_half_open
                {
                    self.transition(&mut machine, CircuitState::Closed, now);
                }
            }
            Verdict::Failure => {
                machine.counts.on_failure();
                let trip = match machine.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => self.config.ready_to_trip(&machine.counts),
                    CircuitState::Open => false,
                };
                if trip {
                    machine.tripped_with = machine.counts.total_failures;
                    self.transition(&mut machine, CircuitState::Open, now);
                }
            }
        }
    }

    /// Apply time-driven changes: interval rollover while closed, recovery while open.
    fn advance(&self, machine: &mut Machine, now: u64) {
        let due = machine.expiry.is_some_and(|expiry| expiry <= now);
        match machine.state {
            CircuitState::Closed if due => self.new_generation(machine, now),
            CircuitState::Open if due => self.transition(machine, CircuitState::HalfOpen, now),
            _ => {}
        }
    }

    fn transition(&self, machine: &mut Machine, to: CircuitState, now: u64) {
        let from = machine.state;
        if from == to {
            return;
        }
        machine.state = to;
        if to == CircuitState::Open {
            machine.opened_at = now;
        }
        self.new_generation(machine, now);

        match to {
            CircuitState::Open => tracing::error!(
                ?from,
                to = ?to,
                failures = machine.tripped_with,
                "circuit breaker state changed"
            ),
            _ => tracing::info!(?from, to = ?to, "circuit breaker state changed"),
        }
    }

    fn new_generation(&self, machine: &mut Machine, now: u64) {
        machine.generation = machine.generation.wrapping_add(1);
        machine.counts = Counts::default();
        machine.expiry = match machine.state {
            CircuitState::Closed if self.config.interval.is_zero() => None,
            CircuitState::Closed => Some(now.saturating_add(millis(self.config.interval))),
            CircuitState::Open => Some(now.saturating_add(millis(self.config.open_timeout))),
            CircuitState::HalfOpen => None,
        };
    }
}

/// Releases the admission slot if the call is dropped before it settles.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_call(self.generation, Verdict::Neutral);
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreaker {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::CIRCUIT_BREAKER
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        self.execute(next.run(ctx, transport, req)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::message;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(max_half_open: u32, interval: Duration, clock: &ManualClock) -> CircuitBreaker {
        let config =
            CircuitBreakerConfig::new(max_half_open, interval, Duration::from_secs(30)).unwrap();
        CircuitBreaker::new(config).with_clock(clock.clone())
    }

    async fn call(breaker: &CircuitBreaker, status: u16) -> Result<Response, DispatchError> {
        let status = StatusCode::from_u16(status).unwrap();
        breaker.execute(async move { Ok(Response::new(status)) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            let _ = call(breaker, 503).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, Duration::ZERO, Duration::from_secs(1)).unwrap_err(),
            ConfigError::MustBePositive { field: "max_half_open" }
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::ZERO, Duration::ZERO).unwrap_err(),
            ConfigError::MustBePositive { field: "open_timeout" }
        );
        let cfg = CircuitBreakerConfig::default();
        assert_eq!(cfg.clone().with_trip(3, 1.5).unwrap_err(), ConfigError::InvalidFailureRatio(1.5));
        assert!(cfg.with_trip(0, 0.5).is_err());
    }

    #[tokio::test]
    async fn starts_closed_and_passes_successes() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(call(&breaker, 200).await.is_ok());
        assert_eq!(breaker.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn trips_on_failure_ratio_and_fails_fast() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        trip(&breaker).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        clock.advance(Duration::from_secs(5));
        let err = breaker
            .execute(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new(StatusCode::OK))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            DispatchError::CircuitOpen { failures, open_for } => {
                assert_eq!(failures, 3);
                assert_eq!(open_for, Duration::from_secs(5));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stays_closed_below_ratio() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        for _ in 0..5 {
            call(&breaker, 200).await.unwrap();
            call(&breaker, 500).await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().requests, 10);
    }

    #[tokio::test]
    async fn client_errors_count_as_success() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        for _ in 0..5 {
            call(&breaker, 404).await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 0);
    }

    #[tokio::test]
    async fn interval_rolls_counts_over() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::from_secs(10), &clock);
        call(&breaker, 503).await.unwrap();
        call(&breaker, 503).await.unwrap();
        assert_eq!(breaker.counts().total_failures, 2);

        clock.advance(Duration::from_secs(11));
        assert_eq!(breaker.counts(), Counts::default());
        call(&breaker, 503).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_consecutive_successes() {
        let clock = ManualClock::new();
        let breaker = breaker(2, Duration::ZERO, &clock);
        trip(&breaker).await;

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        call(&breaker, 200).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        call(&breaker, 200).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        trip(&breaker).await;

        clock.advance(Duration::from_secs(30));
        let err = breaker
            .execute(async { Err(DispatchError::Network(message("connection refused"))) })
            .await
            .unwrap_err();
        assert!(err.is_temporary());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_limited_probes() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        trip(&breaker).await;
        clock.advance(Duration::from_secs(30));

        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(async move {
                        let _ = hold.await;
                        Ok(Response::new(StatusCode::OK))
                    })
                    .await
            })
        };
        while breaker.counts().requests == 0 {
            tokio::task::yield_now().await;
        }

        let err = call(&breaker, 200).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitExhausted { in_flight: 1, max: 1 }));

        release.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn neutral_outcomes_release_slots_without_counting() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        for _ in 0..5 {
            let _ = breaker
                .execute(async {
                    Err(DispatchError::RateLimited {
                        waited: Duration::ZERO,
                        reason: ContextError::DeadlineExceeded,
                    })
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test]
    async fn dropped_probe_frees_its_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        trip(&breaker).await;
        clock.advance(Duration::from_secs(30));

        {
            let pending = breaker.execute(futures::future::pending::<Result<Response, DispatchError>>());
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }
        assert_eq!(breaker.counts().requests, 0);
        assert!(call(&breaker, 200).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn stale_generation_outcomes_are_ignored() {
        let clock = ManualClock::new();
        let breaker = breaker(1, Duration::ZERO, &clock);
        let generation = breaker.before_call().unwrap();
        trip(&breaker).await;

        breaker.after_call(generation, Verdict::Success);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.counts(), Counts::default());
    }
}
