//! Per-request proxy rotation.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::rotation::{Rotator, Strategy};
use crate::transport::{redacted, Transport};
use async_trait::async_trait;
use url::Url;

/// Routes each request through the next proxy in a rotating pool.
///
/// The proxy is applied to a request-scoped copy of the transport. With an empty pool requests
/// go out directly.
#[derive(Debug, Clone)]
pub struct ProxyRotation {
    rotator: Rotator<Url>,
}

impl ProxyRotation {
    pub fn new(proxies: Vec<Url>) -> Self {
        Self::with_strategy(proxies, Strategy::RoundRobin)
    }

    pub fn with_strategy(proxies: Vec<Url>, strategy: Strategy) -> Self {
        Self { rotator: Rotator::new(proxies, strategy) }
    }

    pub fn from_rotator(rotator: Rotator<Url>) -> Self {
        Self { rotator }
    }

    pub fn rotator(&self) -> &Rotator<Url> {
        &self.rotator
    }

    pub fn update_proxies(&self, proxies: Vec<Url>) {
        self.rotator.update_pool(proxies);
    }

    pub fn shuffle(&self) {
        self.rotator.shuffle();
    }

    pub fn count(&self) -> usize {
        self.rotator.count()
    }
}

#[async_trait]
impl Middleware for ProxyRotation {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::PROXY
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        match self.rotator.select() {
            Some(proxy) => {
                tracing::debug!(proxy = %redacted(&proxy), "using proxy");
                let scoped = transport.with_proxy(proxy)?;
                next.run(ctx, &scoped, req).await
            }
            None => next.run(ctx, transport, req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::testing::ScriptedBackend;

    fn request() -> Request {
        http::Request::get("http://api.test/").body(Default::default()).unwrap()
    }

    fn proxies() -> Vec<Url> {
        vec!["http://p1.test:8080".parse().unwrap(), "http://p2.test:8080".parse().unwrap()]
    }

    #[tokio::test]
    async fn each_request_uses_the_next_proxy() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let chain = Chain::new().with(10, ProxyRotation::new(proxies()));

        for _ in 0..3 {
            chain.process(&Context::background(), &transport, request()).await.unwrap();
        }
        let hosts: Vec<String> = backend
            .requests()
            .iter()
            .filter_map(|r| r.proxy.as_ref().and_then(|p| p.host_str().map(str::to_owned)))
            .collect();
        assert_eq!(hosts, vec!["p1.test", "p2.test", "p1.test"]);
        assert!(transport.settings().proxy().is_none());
    }

    #[tokio::test]
    async fn empty_pool_sends_directly() {
        let backend = ScriptedBackend::new();
        let chain = Chain::new().with(10, ProxyRotation::new(Vec::new()));
        chain.process(&Context::background(), &Transport::new(backend.clone()), request()).await.unwrap();
        assert!(backend.requests()[0].proxy.is_none());
    }

    #[tokio::test]
    async fn backends_without_proxy_support_reject_the_request() {
        let backend = ScriptedBackend::new().without_proxy_support();
        let chain = Chain::new().with(10, ProxyRotation::new(proxies()));
        let err = chain
            .process(&Context::background(), &Transport::new(backend.clone()), request())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransport(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn pool_updates_apply_to_later_requests() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let rotation = ProxyRotation::new(proxies());
        let chain = Chain::new().with(10, rotation.clone());

        rotation.update_proxies(vec!["http://p9.test:1".parse().unwrap()]);
        chain.process(&Context::background(), &transport, request()).await.unwrap();
        assert_eq!(rotation.count(), 1);
        assert_eq!(backend.requests()[0].proxy.as_ref().and_then(Url::host_str), Some("p9.test"));
    }
}
