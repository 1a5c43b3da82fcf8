//! Error taxonomy shared by every dispatch policy.
//!
//! Policies never discard the cause they are reacting to: each variant either carries the
//! underlying error or a boxed [`DispatchError`] so that callers can test membership at any
//! wrapping depth with [`DispatchError::is_temporary`], [`DispatchError::has_kind`] and friends,
//! or with the free functions in this module when the dispatch error is buried inside their own
//! error type.
//!
//! Causes are stored behind `Arc` so a single outcome can be cloned and handed to every waiter of
//! a deduplicated request unchanged.

use crate::backoff::BackoffError;
use crate::message::Response;
use http::StatusCode;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shared, cloneable error cause.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Build a [`SharedError`] from a plain message.
pub fn message(msg: impl Into<String>) -> SharedError {
    let boxed: Box<dyn StdError + Send + Sync> = msg.into().into();
    Arc::from(boxed)
}

/// Why a [`Context`](crate::Context) stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextError {
    /// The caller canceled the request.
    Canceled,
    /// The request deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Canceled => write!(f, "context canceled"),
            ContextError::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl StdError for ContextError {}

/// Coarse classification of a [`DispatchError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Canceled,
    BadStatus,
    RateLimited,
    CircuitOpen,
    CircuitExhausted,
    Deduplication,
    RetryExhausted,
    InvalidTransport,
    Permanent,
    Temporary,
    Other,
}

/// How an upstream status code is treated by retry and circuit policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 1xx/2xx/3xx: handed to the caller as a success.
    Success,
    /// 5xx and 429: worth another attempt.
    Temporary,
    /// Every other 4xx.
    Permanent,
}

/// Classify an upstream status code.
pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::Temporary
    } else if status.is_client_error() {
        StatusClass::Permanent
    } else {
        StatusClass::Success
    }
}

/// Unified error type for the dispatch pipeline.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// The upstream could not be reached.
    Network(SharedError),
    /// The transport gave up waiting on the upstream.
    Timeout(SharedError),
    /// The request context was canceled or its deadline passed.
    Canceled {
        reason: ContextError,
        /// Failure observed before the interruption, if any.
        last: Option<Box<DispatchError>>,
    },
    /// The upstream answered with a retryable or permanent error status.
    BadStatus { response: Box<Response> },
    /// Admission control could not grant a token before the context ended.
    RateLimited { waited: Duration, reason: ContextError },
    /// The circuit breaker is rejecting calls.
    CircuitOpen { failures: u32, open_for: Duration },
    /// The half-open probe budget is already in use.
    CircuitExhausted { in_flight: u32, max: u32 },
    /// The in-flight call this request joined never produced a result.
    Deduplication(String),
    /// Every attempt failed; wraps the last failure.
    RetryExhausted { attempts: usize, last: Box<DispatchError> },
    /// The transport cannot carry the requested per-request settings.
    InvalidTransport(String),
    /// Explicitly non-retryable. Overrides any temporary marker deeper in the chain.
    Permanent(SharedError),
    /// Explicitly retryable.
    Temporary(SharedError),
    /// Unclassified failure raised by a caller-supplied policy.
    Other(SharedError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Timeout(e) => write!(f, "timeout error: {}", e),
            Self::Canceled { reason, last: Some(last) } => {
                write!(f, "request interrupted ({}); last error: {}", reason, last)
            }
            Self::Canceled { reason, last: None } => write!(f, "request interrupted ({})", reason),
            Self::BadStatus { response } => write!(f, "bad status code: {}", response.status()),
            Self::RateLimited { waited, reason } => {
                write!(f, "rate limit exceeded after waiting {:?} ({})", waited, reason)
            }
            Self::CircuitOpen { failures, open_for } => write!(
                f,
                "circuit breaker is open ({} failures, open for {:?})",
                failures, open_for
            ),
            Self::CircuitExhausted { in_flight, max } => write!(
                f,
                "circuit breaker is exhausted ({} probes in flight, max {})",
                in_flight, max
            ),
            Self::Deduplication(reason) => write!(f, "deduplication failed: {}", reason),
            Self::RetryExhausted { attempts, last } => {
                write!(f, "retry failed after {} attempts; last error: {}", attempts, last)
            }
            Self::InvalidTransport(reason) => write!(f, "invalid transport: {}", reason),
            Self::Permanent(e) => write!(f, "permanent error: {}", e),
            Self::Temporary(e) => write!(f, "temporary error: {}", e),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for DispatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Network(e)
            | Self::Timeout(e)
            | Self::Permanent(e)
            | Self::Temporary(e)
            | Self::Other(e) => Some(&**e),
            Self::Canceled { last: Some(last), .. } => Some(&**last),
            Self::Canceled { reason, last: None } => Some(reason),
            Self::RateLimited { reason, .. } => Some(reason),
            Self::RetryExhausted { last, .. } => Some(&**last),
            _ => None,
        }
    }
}

impl DispatchError {
    pub fn network<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Network(Arc::new(err))
    }

    pub fn timeout<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Timeout(Arc::new(err))
    }

    /// Mark any error as non-retryable.
    pub fn permanent<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Permanent(Arc::new(err))
    }

    /// Mark any error as retryable.
    pub fn temporary<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Temporary(Arc::new(err))
    }

    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    pub fn canceled(reason: ContextError) -> Self {
        Self::Canceled { reason, last: None }
    }

    pub fn bad_status(response: Response) -> Self {
        Self::BadStatus { response: Box::new(response) }
    }

    /// Variant classification of this error (not of its causes).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::BadStatus { .. } => ErrorKind::BadStatus,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::CircuitExhausted { .. } => ErrorKind::CircuitExhausted,
            Self::Deduplication(_) => ErrorKind::Deduplication,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::InvalidTransport(_) => ErrorKind::InvalidTransport,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Temporary(_) => ErrorKind::Temporary,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Iterate over every `DispatchError` in the cause chain, starting with `self`.
    pub fn chain(&self) -> impl Iterator<Item = &DispatchError> + '_ {
        dispatch_chain(self)
    }

    /// True if any error in the chain has the given kind.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.chain().any(|e| e.kind() == kind)
    }

    pub fn is_temporary(&self) -> bool {
        is_temporary(self)
    }

    pub fn is_permanent(&self) -> bool {
        is_permanent(self)
    }

    pub fn is_timeout(&self) -> bool {
        is_timeout(self)
    }

    pub fn is_canceled(&self) -> bool {
        is_canceled(self)
    }

    pub fn is_circuit_open(&self) -> bool {
        self.has_kind(ErrorKind::CircuitOpen)
    }

    pub fn is_retry_exhausted(&self) -> bool {
        self.has_kind(ErrorKind::RetryExhausted)
    }

    /// Upstream response carried by the first `BadStatus` in the chain.
    pub fn response(&self) -> Option<&Response> {
        self.chain().find_map(|e| match e {
            Self::BadStatus { response } => Some(&**response),
            _ => None,
        })
    }

    /// Status of the first `BadStatus` in the chain.
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(Response::status)
    }

    /// Access retry exhaustion info as (attempts, last failure).
    pub fn retry_exhausted_info(&self) -> Option<(usize, &DispatchError)> {
        match self {
            Self::RetryExhausted { attempts, last } => Some((*attempts, &**last)),
            _ => None,
        }
    }
}

fn dispatch_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a DispatchError> + 'a {
    let mut next = Some(err);
    std::iter::from_fn(move || {
        while let Some(current) = next {
            next = current.source();
            if let Some(found) = current.downcast_ref::<DispatchError>() {
                return Some(found);
            }
        }
        None
    })
}

/// True if `err` (at any depth) is a temporary failure and nothing in the chain marks it
/// permanent or canceled.
pub fn is_temporary(err: &(dyn StdError + 'static)) -> bool {
    let mut temporary = false;
    for e in dispatch_chain(err) {
        match e {
            DispatchError::Permanent(_) | DispatchError::Canceled { .. } => return false,
            DispatchError::BadStatus { response } => match classify_status(response.status()) {
                StatusClass::Temporary => temporary = true,
                StatusClass::Permanent => return false,
                StatusClass::Success => {}
            },
            DispatchError::Network(_)
            | DispatchError::Timeout(_)
            | DispatchError::RateLimited { .. }
            | DispatchError::Temporary(_) => temporary = true,
            _ => {}
        }
    }
    temporary
}

/// True if `err` (at any depth) is marked permanent or carries a non-retryable 4xx status.
pub fn is_permanent(err: &(dyn StdError + 'static)) -> bool {
    dispatch_chain(err).any(|e| match e {
        DispatchError::Permanent(_) => true,
        DispatchError::BadStatus { response } => {
            classify_status(response.status()) == StatusClass::Permanent
        }
        _ => false,
    })
}

/// True if `err` (at any depth) is timeout-classified.
pub fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    dispatch_chain(err).any(|e| match e {
        DispatchError::Timeout(_) | DispatchError::RateLimited { .. } => true,
        DispatchError::Canceled { reason, .. } => *reason == ContextError::DeadlineExceeded,
        _ => false,
    })
}

/// True if `err` (at any depth) stems from the caller's context ending.
pub fn is_canceled(err: &(dyn StdError + 'static)) -> bool {
    dispatch_chain(err)
        .any(|e| matches!(e, DispatchError::Canceled { .. } | DispatchError::RateLimited { .. }))
}

/// Errors produced while validating policy configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("failure_ratio must be within (0, 1] (got {0})")]
    InvalidFailureRatio(f64),
    #[error("rate must be finite and > 0 (got {0})")]
    InvalidRate(f64),
    #[error("burst must be > 0")]
    InvalidBurst,
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("no transport configured and the reqwest backend is disabled")]
    MissingTransport,
    #[error("malformed configuration: {0}")]
    Parse(String),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}
