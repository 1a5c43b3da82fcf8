//! Request-scoped cancellation, deadline, and policy overrides.
//!
//! A [`Context`] travels with one logical request through every policy. Derived contexts
//! inherit their parent's cancellation signals and keep the earliest deadline, so canceling a
//! parent reaches every request derived from it.

use crate::chain::MiddlewareId;
use crate::error::ContextError;
use futures::future::{pending, select_all};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation, deadline, and per-request bypass set.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
    skipped: Vec<MiddlewareId>,
}

/// Cancels every context derived from the one that created it.
///
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a cancelable context.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(rx);
        (child, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that ends at `deadline`, or earlier if the parent does.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        child
    }

    /// Derive a context that ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that bypasses the policy with the given identity.
    pub fn skip(&self, id: MiddlewareId) -> Self {
        let mut child = self.clone();
        if !child.skipped.contains(&id) {
            child.skipped.push(id);
        }
        child
    }

    pub fn is_skipped(&self, id: MiddlewareId) -> bool {
        self.skipped.contains(&id)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check: why the context has ended, if it has.
    pub fn err(&self) -> Option<ContextError> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        let canceled = async {
            if self.signals.is_empty() {
                return pending::<()>().await;
            }
            let waits = self.signals.iter().cloned().map(|mut rx| {
                Box::pin(async move {
                    let sender_gone = rx.wait_for(|canceled| *canceled).await.is_err();
                    if sender_gone {
                        pending::<()>().await;
                    }
                })
            });
            select_all(waits).await;
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = canceled => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                canceled.await;
                ContextError::Canceled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_never_ends() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn cancel_reaches_derived_contexts() {
        let (parent, cancel) = Context::background().with_cancel();
        let child = parent.with_timeout(Duration::from_secs(60)).skip(MiddlewareId::PROXY);

        let waiter = tokio::spawn(async move { child.done().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), ContextError::Canceled);
        assert_eq!(parent.err(), Some(ContextError::Canceled));
        assert!(cancel.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_context() {
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        assert!(ctx.err().is_none());
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() {
        let outer = Context::background().with_timeout(Duration::from_millis(50));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();
        drop(cancel);
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
        assert!(ctx.err().is_none());
    }

    #[test]
    fn skip_is_idempotent() {
        let ctx = Context::background().skip(MiddlewareId::COOKIE).skip(MiddlewareId::COOKIE);
        assert!(ctx.is_skipped(MiddlewareId::COOKIE));
        assert!(!ctx.is_skipped(MiddlewareId::PROXY));
        assert_eq!(ctx.skipped.len(), 1);
    }
}
