//! Request and response values that travel through the chain.
//!
//! Requests are `http::Request<Bytes>`: the body is an immutable buffer, so policies that need
//! to inspect it (fingerprinting, caching) borrow it instead of draining a reader. Responses are
//! fully buffered and cheap to clone, so one upstream answer can be handed to many callers and
//! each of them can read the body independently.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

/// Outbound request handled by the dispatch chain.
pub type Request = http::Request<Bytes>;

/// Copy a request so it can be sent again.
///
/// `http::Request` is not `Clone`; the body is a shared buffer, so this is cheap.
pub fn clone_request(req: &Request) -> Request {
    let mut out = http::Request::new(req.body().clone());
    *out.method_mut() = req.method().clone();
    *out.uri_mut() = req.uri().clone();
    *out.version_mut() = req.version();
    *out.headers_mut() = req.headers().clone();
    *out.extensions_mut() = req.extensions().clone();
    out
}

/// Buffered upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self { status, version: Version::HTTP_11, headers: HeaderMap::new(), body: Bytes::new() }
    }

    /// Response with the given status and body.
    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self { body: body.into(), ..Self::new(status) }
    }

    pub fn from_parts(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, version, headers, body }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<http::Response<Bytes>> for Response {
    fn from(resp: http::Response<Bytes>) -> Self {
        let (parts, body) = resp.into_parts();
        Self { status: parts.status, version: parts.version, headers: parts.headers, body }
    }
}

impl From<Response> for http::Response<Bytes> {
    fn from(resp: Response) -> Self {
        let mut out = http::Response::new(resp.body);
        *out.status_mut() = resp.status;
        *out.version_mut() = resp.version;
        *out.headers_mut() = resp.headers;
        out
    }
}
