//! Static header injection.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::{ConfigError, DispatchError};
use crate::message::{Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Adds a fixed set of headers to every request.
///
/// Values are appended, so a header the request already carries keeps its original value too.
#[derive(Debug, Clone, Default)]
pub struct HeaderInjection {
    headers: HeaderMap,
}

impl HeaderInjection {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Build from string pairs, validating names and values.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let invalid = |reason: String| ConfigError::InvalidHeader {
                name: name.as_ref().to_owned(),
                reason,
            };
            let header = HeaderName::from_bytes(name.as_ref().as_bytes())
                .map_err(|e| invalid(e.to_string()))?;
            let value =
                HeaderValue::from_str(value.as_ref()).map_err(|e| invalid(e.to_string()))?;
            headers.append(header, value);
        }
        Ok(Self { headers })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[async_trait]
impl Middleware for HeaderInjection {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::HEADER
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        mut req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        for (name, value) in &self.headers {
            req.headers_mut().append(name, value.clone());
        }
        next.run(ctx, transport, req).await
    }
}
