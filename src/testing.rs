//! In-process backend for exercising chains without a network.

use crate::error::DispatchError;
use crate::message::{Request, Response};
use crate::transport::{Backend, TransportSettings};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

/// What the backend saw for one call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub proxy: Option<Url>,
}

#[derive(Debug)]
struct Script {
    queued: VecDeque<Result<Response, DispatchError>>,
    fallback: Result<Response, DispatchError>,
    seen: Vec<RecordedRequest>,
}

/// Backend that replays queued outcomes, then repeats a fallback.
///
/// Clones share the script and the call counter.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    proxies: bool,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Answers `200 OK` with body `ok` until told otherwise.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                queued: VecDeque::new(),
                fallback: Ok(Response::with_body(StatusCode::OK, "ok")),
                seen: Vec::new(),
            })),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            proxies: true,
        }
    }

    /// Wait this long (on the tokio timer) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_proxy_support(mut self) -> Self {
        self.proxies = false;
        self
    }

    /// Outcome returned once the queue is empty.
    pub fn always(self, outcome: Result<Response, DispatchError>) -> Self {
        self.lock().fallback = outcome;
        self
    }

    /// Queue one outcome.
    pub fn then(self, outcome: Result<Response, DispatchError>) -> Self {
        self.push(outcome);
        self
    }

    /// Queue a response with the given status.
    pub fn then_status(self, status: StatusCode) -> Self {
        self.then(Ok(Response::new(status)))
    }

    pub fn push(&self, outcome: Result<Response, DispatchError>) {
        self.lock().queued.push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().seen.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(
        &self,
        settings: &TransportSettings,
        req: Request,
    ) -> Result<Response, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut script = self.lock();
            script.seen.push(RecordedRequest {
                method: req.method().clone(),
                uri: req.uri().clone(),
                headers: req.headers().clone(),
                proxy: settings.proxy().cloned(),
            });
            match script.queued.pop_front() {
                Some(outcome) => outcome,
                None => script.fallback.clone(),
            }
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }

    fn supports_proxy(&self) -> bool {
        self.proxies
    }
}
