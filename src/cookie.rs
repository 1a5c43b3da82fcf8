//! Per-request cookie-set rotation.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::{ConfigError, DispatchError};
use crate::message::{Request, Response};
use crate::rotation::{Rotator, Strategy};
use crate::transport::Transport;
use async_trait::async_trait;
use http::header::COOKIE;
use http::HeaderValue;

/// One name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Cookies rendered once into a `Cookie` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSet {
    cookies: Vec<Cookie>,
    header: HeaderValue,
}

impl CookieSet {
    /// Fails when a cookie cannot appear in a header.
    pub fn new(cookies: Vec<Cookie>) -> Result<Self, ConfigError> {
        let rendered = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        let header = HeaderValue::from_str(&rendered).map_err(|e| ConfigError::InvalidHeader {
            name: COOKIE.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { cookies, header })
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Append to any `Cookie` header the request already carries.
    fn apply(&self, req: &mut Request) {
        if self.is_empty() {
            return;
        }
        let merged = match req.headers().get(COOKIE) {
            Some(existing) => {
                let mut bytes = existing.as_bytes().to_vec();
                bytes.extend_from_slice(b"; ");
                bytes.extend_from_slice(self.header.as_bytes());
                HeaderValue::from_bytes(&bytes).unwrap_or_else(|_| self.header.clone())
            }
            None => self.header.clone(),
        };
        req.headers_mut().insert(COOKIE, merged);
    }
}

/// Attaches the next cookie set from a rotating pool to each request.
#[derive(Debug, Clone)]
pub struct CookieRotation {
    rotator: Rotator<CookieSet>,
}

impl CookieRotation {
    pub fn new(sets: Vec<CookieSet>) -> Self {
        Self::with_strategy(sets, Strategy::RoundRobin)
    }

    pub fn with_strategy(sets: Vec<CookieSet>, strategy: Strategy) -> Self {
        Self { rotator: Rotator::new(sets, strategy) }
    }

    pub fn rotator(&self) -> &Rotator<CookieSet> {
        &self.rotator
    }

    pub fn update_sets(&self, sets: Vec<CookieSet>) {
        self.rotator.update_pool(sets);
    }

    pub fn shuffle(&self) {
        self.rotator.shuffle();
    }

    pub fn count(&self) -> usize {
        self.rotator.count()
    }
}

#[async_trait]
impl Middleware for CookieRotation {
    fn id(&self) -> MiddlewareId {
        MiddlewareId::COOKIE
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        mut req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        if let Some(set) = self.rotator.select() {
            set.apply(&mut req);
        }
        next.run(ctx, transport, req).await
    }
}
