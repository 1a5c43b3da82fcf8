//! The caller-facing entry point: a [`Chain`] bound to a [`Transport`].

use crate::builder::DispatcherBuilder;
use crate::chain::Chain;
use crate::context::Context;
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::transport::Transport;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::Poll;
use tower_service::Service;

/// Sends requests through a chain of policies.
///
/// Clones share the chain, so policies added or removed on one handle apply to all of them and
/// to requests already queued behind them.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    chain: Arc<Chain>,
    transport: Transport,
}

impl Dispatcher {
    pub fn new(chain: Chain, transport: Transport) -> Self {
        Self { chain: Arc::new(chain), transport }
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// The live chain; edits take effect for the next request.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn dispatch(&self, ctx: &Context, req: Request) -> Result<Response, DispatchError> {
        tracing::debug!(method = %req.method(), uri = %req.uri(), "dispatching request");
        let result = self.chain.process(ctx, &self.transport, req).await;
        if let Err(err) = &result {
            tracing::debug!(error = %err, kind = ?err.kind(), "dispatch failed");
        }
        result
    }
}

/// Dispatches under a background context.
impl Service<Request> for Dispatcher {
    type Response = Response;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Response, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.dispatch(&Context::background(), req).await })
    }
}

/// Dispatches under the caller's context.
impl Service<(Context, Request)> for Dispatcher {
    type Response = Response;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Response, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (ctx, req): (Context, Request)) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.dispatch(&ctx, req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderInjection;
    use crate::testing::ScriptedBackend;
    use std::time::Duration;
    use tower::ServiceExt;

    fn request() -> Request {
        http::Request::get("http://api.test/items").body(Default::default()).unwrap()
    }

    #[tokio::test]
    async fn dispatch_runs_the_chain() {
        let backend = ScriptedBackend::new();
        let chain = Chain::new().with(20, HeaderInjection::from_pairs([("x-a", "1")]).unwrap());
        let dispatcher = Dispatcher::new(chain, Transport::new(backend.clone()));

        let resp = dispatcher.dispatch(&Context::background(), request()).await.unwrap();
        assert_eq!(resp.text(), "ok");
        assert_eq!(backend.requests()[0].headers["x-a"], "1");
    }

    #[tokio::test]
    async fn works_as_a_tower_service() {
        let backend = ScriptedBackend::new();
        let dispatcher = Dispatcher::new(Chain::new(), Transport::new(backend.clone()));

        let resp = dispatcher.clone().oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = dispatcher.oneshot((ctx, request())).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_chain_edits() {
        let backend = ScriptedBackend::new().with_delay(Duration::from_millis(1));
        let dispatcher = Dispatcher::new(Chain::new(), Transport::new(backend.clone()));
        let other = dispatcher.clone();

        other.chain().add(20, HeaderInjection::from_pairs([("x-b", "2")]).unwrap());
        dispatcher.dispatch(&Context::background(), request()).await.unwrap();
        assert_eq!(backend.requests()[0].headers["x-b"], "2");
    }
}
