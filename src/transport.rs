//! The terminal step of every chain: sending a request upstream.
//!
//! A [`Transport`] pairs a shared [`Backend`] with per-request [`TransportSettings`]. Policies
//! that change how a request leaves (proxy selection, per-call timeouts) derive a request-scoped
//! copy with [`Transport::with_proxy`] or [`Transport::with_timeout`]; the shared configuration
//! is never mutated, so concurrent requests through different proxies do not interfere.

#[cfg(feature = "reqwest")]
mod reqwest_backend;

#[cfg(feature = "reqwest")]
pub use reqwest_backend::ReqwestBackend;

use crate::context::Context;
use crate::error::DispatchError;
use crate::message::{Request, Response};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_service::Service;
use url::Url;

/// Performs the network round trip.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        settings: &TransportSettings,
        req: Request,
    ) -> Result<Response, DispatchError>;

    /// Whether [`TransportSettings::proxy`] is honored.
    fn supports_proxy(&self) -> bool {
        false
    }
}

/// Request-scoped transport options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSettings {
    proxy: Option<Url>,
    timeout: Option<Duration>,
}

impl TransportSettings {
    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Cheap-to-clone handle to a backend plus the settings for one request.
#[derive(Debug, Clone)]
pub struct Transport {
    backend: Arc<dyn Backend>,
    settings: Arc<TransportSettings>,
}

const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

impl Transport {
    pub fn new<B>(backend: B) -> Self
    where
        B: Backend + 'static,
    {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self { backend, settings: Arc::new(TransportSettings::default()) }
    }

    /// Transport backed by a pooled `reqwest` client.
    #[cfg(feature = "reqwest")]
    pub fn reqwest() -> Self {
        Self::new(ReqwestBackend::new())
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Whether two transports send through the same backend.
    pub fn shares_backend(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    /// Copy of this transport that routes through `proxy`.
    ///
    /// Fails when the backend cannot use proxies or the proxy URL has an unsupported scheme.
    pub fn with_proxy(&self, proxy: Url) -> Result<Self, DispatchError> {
        if !self.backend.supports_proxy() {
            return Err(DispatchError::InvalidTransport(
                "backend does not support proxies".to_string(),
            ));
        }
        if !PROXY_SCHEMES.contains(&proxy.scheme()) {
            return Err(DispatchError::InvalidTransport(format!(
                "unsupported proxy scheme {:?}",
                proxy.scheme()
            )));
        }
        let mut settings = (*self.settings).clone();
        settings.proxy = Some(proxy);
        Ok(Self { backend: self.backend.clone(), settings: Arc::new(settings) })
    }

    /// Copy of this transport that bounds each send by `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut settings = (*self.settings).clone();
        settings.timeout = Some(timeout);
        Self { backend: self.backend.clone(), settings: Arc::new(settings) }
    }

    /// Send `req`, giving up as soon as `ctx` ends.
    pub async fn send(&self, ctx: &Context, req: Request) -> Result<Response, DispatchError> {
        if let Some(reason) = ctx.err() {
            return Err(DispatchError::canceled(reason));
        }
        tracing::debug!(
            method = %req.method(),
            url = %req.uri(),
            headers = req.headers().len(),
            proxy = ?self.settings.proxy.as_ref().map(redacted),
            "sending request"
        );
        let result = tokio::select! {
            biased;
            reason = ctx.done() => Err(DispatchError::canceled(reason)),
            result = self.backend.execute(&self.settings, req) => result,
        };
        match &result {
            Ok(resp) => tracing::debug!(status = resp.status().as_u16(), "received response"),
            Err(err) => tracing::debug!(error = %err, "request failed"),
        }
        result
    }
}

/// `scheme://host:port` of a proxy URL, dropping any credentials it carries.
pub(crate) fn redacted(proxy: &Url) -> String {
    match (proxy.host_str(), proxy.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", proxy.scheme()),
        (Some(host), None) => format!("{}://{host}", proxy.scheme()),
        _ => proxy.scheme().to_owned(),
    }
}

/// Adapts any `tower` service into a [`Backend`].
///
/// The service is cloned per call, so it must be cheap to clone. Proxies are not supported.
#[derive(Debug, Clone)]
pub struct ServiceBackend<S> {
    inner: S,
}

impl<S> ServiceBackend<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Backend for ServiceBackend<S>
where
    S: Service<Request, Response = Response, Error = DispatchError>
        + Clone
        + Send
        + Sync
        + fmt::Debug
        + 'static,
    S::Future: Send,
{
    async fn execute(
        &self,
        _settings: &TransportSettings,
        req: Request,
    ) -> Result<Response, DispatchError> {
        self.inner.clone().oneshot(req).await
    }
}
