//! Prioritized middleware chain.
//!
//! Every policy implements [`Middleware`]: it receives the request plus a [`Next`] continuation
//! and decides whether to short-circuit, mutate, delay, or re-invoke the rest of the chain. The
//! innermost continuation is the transport call.
//!
//! Ordering rules:
//! - entries run in descending priority; equal priorities keep insertion order;
//! - adding a policy whose [`MiddlewareId`] is already present replaces it in its slot;
//! - a request can bypass a policy via [`Context::skip`].
//!
//! Entries live in a [`DynamicConfig`] snapshot, so a dispatch that has started keeps the chain
//! it started with even if the chain is reconfigured concurrently.

use crate::adaptive::DynamicConfig;
use crate::context::Context;
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Stable identity of a policy, used for add-or-replace and per-request bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiddlewareId(&'static str);

impl MiddlewareId {
    pub const RETRY: Self = Self("retry");
    pub const CIRCUIT_BREAKER: Self = Self("circuit_breaker");
    pub const DEDUP: Self = Self("dedup");
    pub const CACHE: Self = Self("cache");
    pub const RATE_LIMIT: Self = Self("rate_limit");
    pub const HEADER: Self = Self("header");
    pub const COOKIE: Self = Self("cookie");
    pub const PROXY: Self = Self("proxy");

    /// Identity for a caller-supplied policy.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MiddlewareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A policy in the dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Identity used for replacement and bypass.
    fn id(&self) -> MiddlewareId;

    /// Handle `req`, calling `next` zero or more times.
    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError>;
}

/// A chain slot.
#[derive(Debug, Clone)]
pub struct Entry {
    priority: i32,
    middleware: Arc<dyn Middleware>,
}

impl Entry {
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn id(&self) -> MiddlewareId {
        self.middleware.id()
    }

    pub fn middleware(&self) -> &Arc<dyn Middleware> {
        &self.middleware
    }
}

/// Continuation invoking the remainder of the chain.
#[derive(Debug, Clone, Copy)]
pub struct Next<'a> {
    entries: &'a [Entry],
}

impl<'a> Next<'a> {
    /// Run the remaining policies, then the transport. May be called repeatedly.
    pub async fn run(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
    ) -> Result<Response, DispatchError> {
        let mut rest = self.entries;
        while let Some((entry, tail)) = rest.split_first() {
            if ctx.is_skipped(entry.id()) {
                rest = tail;
                continue;
            }
            return entry.middleware.process(ctx, transport, req, Next { entries: tail }).await;
        }
        transport.send(ctx, req).await
    }

    /// Number of policies still ahead, including bypassed ones.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

/// Ordered set of policies around the transport call.
#[derive(Debug, Clone)]
pub struct Chain {
    entries: DynamicConfig<Vec<Entry>>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    pub fn new() -> Self {
        Self { entries: DynamicConfig::new(Vec::new()) }
    }

    /// Builder-style [`Chain::add`].
    pub fn with<M>(self, priority: i32, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.add(priority, middleware);
        self
    }

    /// Add a policy, or replace the one sharing its identity.
    pub fn add<M>(&self, priority: i32, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.add_all(priority, [Arc::new(middleware) as Arc<dyn Middleware>]);
    }

    /// Add or replace several policies at one priority, then re-sort once.
    ///
    /// A replaced entry keeps its slot and takes the new priority; the stable sort leaves entries
    /// of equal priority in their existing order.
    pub fn add_all<I>(&self, priority: i32, middlewares: I)
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        let incoming: Vec<Arc<dyn Middleware>> = middlewares.into_iter().collect();
        self.entries.update(|current| {
            let mut next = current.clone();
            for middleware in &incoming {
                let entry = Entry { priority, middleware: middleware.clone() };
                match next.iter_mut().find(|e| e.id() == middleware.id()) {
                    Some(slot) => *slot = entry,
                    None => next.push(entry),
                }
            }
            next.sort_by(|a, b| b.priority.cmp(&a.priority));
            next
        });
    }

    /// Remove the policy with the given identity. Returns whether one was present.
    pub fn remove(&self, id: MiddlewareId) -> bool {
        let mut removed = false;
        self.entries.update(|current| {
            let next: Vec<Entry> = current.iter().filter(|e| e.id() != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Policies in execution order.
    pub fn list(&self) -> Vec<Arc<dyn Middleware>> {
        self.entries.get().iter().map(|e| e.middleware.clone()).collect()
    }

    /// Snapshot of the entries in execution order.
    pub fn entries(&self) -> Arc<Vec<Entry>> {
        self.entries.get()
    }

    pub fn count(&self) -> usize {
        self.entries.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Run `req` through every policy and finally the transport.
    pub async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
    ) -> Result<Response, DispatchError> {
        let entries = self.entries.get();
        if tracing::enabled!(tracing::Level::DEBUG) {
            for (index, entry) in entries.iter().enumerate() {
                tracing::debug!(index, id = %entry.id(), priority = entry.priority, "middleware in chain");
            }
        }
        Next { entries: &entries }.run(ctx, transport, req).await
    }
}
