//! Delay schedules between retry attempts.
//!
//! `attempt` is the zero-based index of the retry about to be made: the wait before the first
//! retry is `delay(0)`. Exponential schedules compute `min(initial * 2^attempt, max)`.
//!
//! ```rust
//! use std::time::Duration;
//! use relaywire::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(800));
//! assert_eq!(backoff.delay(4), Duration::from_secs(1));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`].

use std::fmt;
use std::time::Duration;

/// Ceiling applied when a schedule would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanInitial { initial: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanInitial { initial, max } => {
                write!(f, "max ({:?}) must be >= initial ({:?})", max, initial)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant(Duration),
    Exponential { initial: Duration, max: Option<Duration> },
}

/// Wait schedule for the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    /// Same wait before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay) }
    }

    /// Doubling wait starting at `initial`, uncapped until [`Backoff::with_max`].
    pub fn exponential(initial: Duration) -> Self {
        Self { schedule: Schedule::Exponential { initial, max: None } }
    }

    /// Cap an exponential schedule.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.schedule {
            Schedule::Exponential { initial, max: existing } => {
                if max < *initial {
                    return Err(BackoffError::MaxLessThanInitial { initial: *initial, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            Schedule::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Wait before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self.schedule {
            Schedule::Constant(delay) => delay.min(MAX_BACKOFF),
            Schedule::Exponential { initial, max } => {
                let exponent = attempt.min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = initial.as_nanos().saturating_mul(multiplier);
                let grown = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(grown, |m| grown.min(m)).min(MAX_BACKOFF)
            }
        }
    }

    /// Configured ceiling, if any.
    pub fn max(&self) -> Option<Duration> {
        match self.schedule {
            Schedule::Constant(delay) => Some(delay),
            Schedule::Exponential { max, .. } => max,
        }
    }
}
