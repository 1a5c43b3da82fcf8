use super::{redacted, Backend, TransportSettings};
use crate::error::DispatchError;
use crate::message::{Request, Response};
use async_trait::async_trait;
use moka::sync::Cache;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Distinct proxies that keep a pooled client at once.
pub const DEFAULT_MAX_CLIENTS: u64 = 64;
/// A client unused for this long is dropped along with its connections.
pub const DEFAULT_CLIENT_IDLE: Duration = Duration::from_secs(300);

/// [`Backend`] over `reqwest`, keeping one pooled client per proxy.
///
/// Clients are built lazily the first time a proxy is used and reused afterwards, so
/// connection pools survive across requests. The client cache is bounded and idle clients
/// expire, so rotating through many proxies over time does not pin every pool. Requests
/// without a proxy never consult the environment's proxy variables.
pub struct ReqwestBackend {
    clients: Cache<Option<Url>, reqwest::Client>,
}

impl fmt::Debug for ReqwestBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestBackend")
            .field("clients", &self.clients.entry_count())
            .finish()
    }
}

impl Default for ReqwestBackend {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_CLIENTS, DEFAULT_CLIENT_IDLE)
    }
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_clients: u64, idle: Duration) -> Self {
        let clients = Cache::builder()
            .name("relaywire-clients")
            .max_capacity(max_clients)
            .time_to_idle(idle)
            .build();
        Self { clients }
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<reqwest::Client, DispatchError> {
        self.clients
            .try_get_with(proxy.cloned(), || build_client(proxy))
            .map_err(|err| (*err).clone())
    }
}

fn build_client(proxy: Option<&Url>) -> Result<reqwest::Client, DispatchError> {
    let builder = match proxy {
        Some(url) => {
            let proxy = reqwest::Proxy::all(url.as_str())
                .map_err(|e| DispatchError::InvalidTransport(e.to_string()))?;
            reqwest::Client::builder().proxy(proxy)
        }
        None => reqwest::Client::builder().no_proxy(),
    };
    let client = builder.build().map_err(|e| DispatchError::InvalidTransport(e.to_string()))?;
    tracing::debug!(proxy = ?proxy.map(redacted), "built http client");
    Ok(client)
}

fn map_error(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::timeout(err)
    } else if err.is_builder() {
        DispatchError::permanent(err)
    } else {
        DispatchError::network(err)
    }
}

#[async_trait]
impl Backend for ReqwestBackend {
    async fn execute(
        &self,
        settings: &TransportSettings,
        req: Request,
    ) -> Result<Response, DispatchError> {
        let client = self.client_for(settings.proxy())?;
        let mut request = reqwest::Request::try_from(req).map_err(DispatchError::permanent)?;
        if let Some(timeout) = settings.timeout() {
            *request.timeout_mut() = Some(timeout);
        }

        let resp = client.execute(request).await.map_err(map_error)?;
        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(map_error)?;
        Ok(Response::from_parts(status, version, headers, body))
    }

    fn supports_proxy(&self) -> bool {
        true
    }
}
