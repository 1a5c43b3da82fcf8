//! Stable request identity for coalescing and caching.
//!
//! Two requests share a fingerprint when they agree on method, normalized URL, headers (in any
//! order), and body. URL normalization lowercases scheme and host, drops default ports and the
//! fragment, and sorts query pairs. Each component is length-prefixed before hashing, so moving
//! bytes between components changes the result.

use crate::message::Request;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use http::Uri;
use std::fmt;
use url::Url;
use xxhash_rust::xxh3::Xxh3;

/// 64-bit request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Identity for coalescing: credentials headers are ignored.
    pub fn of(req: &Request) -> Self {
        Self::compute(req, true)
    }

    /// Identity for caching: every header counts, so responses never cross credentials.
    pub fn with_credentials(req: &Request) -> Self {
        Self::compute(req, false)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    fn compute(req: &Request, skip_credentials: bool) -> Self {
        let mut hasher = Xxh3::new();
        write_field(&mut hasher, req.method().as_str().as_bytes());
        write_field(&mut hasher, normalized_url(req.uri()).as_bytes());

        let mut headers: Vec<(&str, &[u8])> = req
            .headers()
            .iter()
            .filter(|(name, _)| {
                !(skip_credentials && (*name == AUTHORIZATION || *name == PROXY_AUTHORIZATION))
            })
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(b.0));
        hasher.update(&(headers.len() as u64).to_le_bytes());
        for (name, value) in headers {
            write_field(&mut hasher, name.as_bytes());
            write_field(&mut hasher, value);
        }

        write_field(&mut hasher, req.body());
        Self(hasher.digest())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn write_field(hasher: &mut Xxh3, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Relative URIs are hashed verbatim.
fn normalized_url(uri: &Uri) -> String {
    let Ok(mut url) = Url::parse(&uri.to_string()) else {
        return uri.to_string();
    };
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.into()
}
