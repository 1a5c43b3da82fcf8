//! Single-flight coalescing of identical concurrent requests.
//!
//! The first request for a [`Fingerprint`] becomes the leader and runs the rest of the chain.
//! Requests arriving with the same fingerprint while it is in flight wait for the leader's
//! outcome instead of calling upstream themselves; every one of them receives an independent
//! clone of the response (or error).
//!
//! Invariants:
//! - at most one upstream call per fingerprint is in flight;
//! - the in-flight entry is removed when the leader finishes, so later requests start fresh;
//! - a waiter whose own context ends stops waiting without affecting the leader;
//! - if the leader is dropped mid-flight, one waiter takes over and runs its own copy of the
//!   request, so the remaining callers still get a real outcome.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::DispatchError;
use crate::fingerprint::Fingerprint;
use crate::message::{Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uniflight::UniFlight;

type Outcome = Result<Response, DispatchError>;

/// Coalesces concurrent requests that share a fingerprint. Clones share the in-flight table.
#[derive(Clone, Default)]
pub struct Deduplicator {
    flights: Arc<UniFlight<Fingerprint, Outcome>>,
    // callers per fingerprint, for introspection and join logging
    callers: Arc<Mutex<HashMap<Fingerprint, usize>>>,
}

impl fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deduplicator").field("in_flight", &self.in_flight()).finish()
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fingerprints currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, usize>> {
        self.callers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, key: Fingerprint) -> Caller<'_> {
        let mut callers = self.lock();
        let count = callers.entry(key).or_insert(0);
        if *count > 0 {
            tracing::debug!(fingerprint = %key, waiting = *count, "joined in-flight request");
        }
        *count += 1;
        Caller { table: self, key }
    }

    /// Run `work` for `key` unless an identical call is already in flight, in which case wait for
    /// its outcome. A waiter keeps `work` so it can take over if the leader goes away.
    pub async fn run<F, Fut>(&self, ctx: &Context, key: Fingerprint, work: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let _caller = self.join(key);
        let flight = self.flights.work(key, work);
        tokio::select! {
            biased;
            reason = ctx.done() => Err(DispatchError::canceled(reason)),
            outcome = flight => outcome,
        }
    }
}

/// Removes the caller from the table when its call completes or is dropped.
struct Caller<'a> {
    table: &'a Deduplicator,
    key: Fingerprint,
}

impl Drop for Caller<'_> {
    fn drop(&mut self) {
        let mut callers = self.table.lock();
        if let Some(count) = callers.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                callers.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl Middleware for Deduplicator {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::DEDUP
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        let key = Fingerprint::of(&req);
        self.run(ctx, key, || next.run(ctx, transport, req)).await
    }
}
