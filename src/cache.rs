//! Response caching keyed by request fingerprint.
//!
//! Only successful (2xx) responses are stored. A store that fails to read or write is logged and
//! treated as a miss: caching never turns a good upstream response into an error.

use crate::chain::{Middleware, MiddlewareId, Next};
use crate::context::Context;
use crate::error::{DispatchError, SharedError};
use crate::fingerprint::Fingerprint;
use crate::message::{Request, Response};
use crate::transport::Transport;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entries kept by [`InMemoryCacheStore::new`] before the least valuable ones are evicted.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Storage behind [`ResponseCache`].
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Response>, SharedError>;
    async fn put(&self, key: &str, response: Response, ttl: Duration) -> Result<(), SharedError>;
}

#[derive(Debug, Clone)]
struct Entry {
    response: Response,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Process-local store backed by a bounded moka cache.
///
/// Each entry expires after the TTL it was stored with; expired entries are never returned and
/// are reclaimed by the cache's own housekeeping.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    entries: Cache<String, Entry>,
}

impl fmt::Debug for InMemoryCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheStore")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .name("relaywire-responses")
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { entries }
    }

    /// Live entries, after pending evictions and expirations have been applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Response>, SharedError> {
        Ok(self.entries.get(key).await.map(|entry| entry.response))
    }

    async fn put(&self, key: &str, response: Response, ttl: Duration) -> Result<(), SharedError> {
        self.entries.insert(key.to_owned(), Entry { response, ttl }).await;
        Ok(())
    }
}

/// Serves repeated requests from a [`CacheStore`].
///
/// The key is taken from the request as it reaches the cache's position in the chain. At the
/// default [`priority`](crate::builder::priority) that is before cookie rotation and proxy
/// selection run, so credentials the caller put on the request separate entries while a rotated
/// cookie set or proxy does not. Place the cache below the cookie policy to key on the rotated
/// cookies as well.
#[derive(Debug, Clone)]
pub struct ResponseCache<S = InMemoryCacheStore> {
    store: Arc<S>,
    ttl: Duration,
}

impl ResponseCache<InMemoryCacheStore> {
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(InMemoryCacheStore::new(), ttl)
    }
}

impl<S> ResponseCache<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store: Arc::new(store), ttl }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Cache key; includes credential headers so entries never cross callers.
pub fn cache_key(req: &Request) -> String {
    format!("cache:{}", Fingerprint::with_credentials(req))
}

#[async_trait]
impl<S> Middleware for ResponseCache<S>
where
    S: CacheStore + 'static,
{
    fn id(&self) -> MiddlewareId {
        MiddlewareId::CACHE
    }

    async fn process(
        &self,
        ctx: &Context,
        transport: &Transport,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, DispatchError> {
        let key = cache_key(&req);
        match self.store.get(&key).await {
            Ok(Some(response)) => {
                tracing::debug!(key = %key, "cache hit");
                return Ok(response);
            }
            Ok(None) => tracing::debug!(key = %key, "cache miss"),
            Err(err) => tracing::error!(key = %key, error = %err, "cache read failed"),
        }

        let response = next.run(ctx, transport, req).await?;
        if response.status().is_success() {
            if let Err(err) = self.store.put(&key, response.clone(), self.ttl).await {
                tracing::error!(key = %key, error = %err, "cache write failed");
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::cookie::{Cookie, CookieRotation, CookieSet};
    use crate::error::message;
    use crate::testing::ScriptedBackend;
    use http::StatusCode;

    fn request(path: &str) -> Request {
        http::Request::get(format!("http://api.test{path}")).body(Default::default()).unwrap()
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Response>, SharedError> {
            Err(message("store offline"))
        }

        async fn put(&self, _key: &str, _resp: Response, _ttl: Duration) -> Result<(), SharedError> {
            Err(message("store offline"))
        }
    }

    #[tokio::test]
    async fn repeated_requests_are_served_from_cache_until_expiry() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let chain = Chain::new().with(35, ResponseCache::in_memory(Duration::from_millis(100)));
        let ctx = Context::background();

        chain.process(&ctx, &transport, request("/a")).await.unwrap();
        let cached = chain.process(&ctx, &transport, request("/a")).await.unwrap();
        assert_eq!(cached.text(), "ok");
        assert_eq!(backend.calls(), 1);

        // moka keeps its own clock, so expiry needs real time to pass
        std::thread::sleep(Duration::from_millis(150));
        chain.process(&ctx, &transport, request("/a")).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_reclaimed() {
        let store = InMemoryCacheStore::new();
        for n in 0..200 {
            let key = format!("k{n}");
            store.put(&key, Response::new(StatusCode::OK), Duration::from_millis(1)).await.unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));

        assert!(store.get("k0").await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn store_stays_within_its_capacity() {
        let store = InMemoryCacheStore::with_capacity(16);
        for n in 0..500 {
            let key = format!("k{n}");
            store.put(&key, Response::new(StatusCode::OK), Duration::from_secs(3600)).await.unwrap();
        }
        assert!(store.len().await <= 16);
    }

    #[tokio::test]
    async fn non_success_responses_are_not_cached() {
        let backend = ScriptedBackend::new().always(Ok(Response::new(StatusCode::NOT_FOUND)));
        let transport = Transport::new(backend.clone());
        let cache = ResponseCache::in_memory(Duration::from_secs(60));
        let chain = Chain::new().with(35, cache.clone());

        for _ in 0..2 {
            let resp = chain.process(&Context::background(), &transport, request("/missing")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
        assert_eq!(backend.calls(), 2);
        assert!(cache.store().is_empty().await);
    }

    #[tokio::test]
    async fn store_failures_fall_through_to_upstream() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let chain = Chain::new().with(35, ResponseCache::new(BrokenStore, Duration::from_secs(1)));

        for _ in 0..2 {
            let resp = chain.process(&Context::background(), &transport, request("/x")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn credentials_separate_cache_entries() {
        let plain = request("/me");
        let authed = http::Request::get("http://api.test/me")
            .header(http::header::AUTHORIZATION, "Bearer t")
            .body(Default::default())
            .unwrap();
        assert_ne!(cache_key(&plain), cache_key(&authed));
    }

    fn cookie_sets() -> Vec<CookieSet> {
        ["alice", "bob"]
            .iter()
            .map(|user| CookieSet::new(vec![Cookie::new("sid", *user)]).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn key_is_taken_before_cookie_rotation_at_default_positions() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let chain = Chain::new()
            .with(35, ResponseCache::in_memory(Duration::from_secs(60)))
            .with(15, CookieRotation::new(cookie_sets()));
        let ctx = Context::background();

        chain.process(&ctx, &transport, request("/profile")).await.unwrap();
        chain.process(&ctx, &transport, request("/profile")).await.unwrap();
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn cache_below_cookie_rotation_keys_on_rotated_cookies() {
        let backend = ScriptedBackend::new();
        let transport = Transport::new(backend.clone());
        let chain = Chain::new()
            .with(15, CookieRotation::new(cookie_sets()))
            .with(12, ResponseCache::in_memory(Duration::from_secs(60)));
        let ctx = Context::background();

        for _ in 0..4 {
            chain.process(&ctx, &transport, request("/profile")).await.unwrap();
        }
        assert_eq!(backend.calls(), 2);
    }
}
