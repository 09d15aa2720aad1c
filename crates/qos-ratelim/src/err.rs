//! Error types for the rate limiter.

use std::time::Instant;

use thiserror::Error;

/// An error returned when a reservation cannot be made.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReserveError {
    /// The request is larger than the bucket could ever hold.
    ///
    /// This usually means that the burst size was lowered between the moment
    /// the caller looked at the limit and the moment it asked for tokens.
    #[error("Cannot reserve {requested} tokens: burst size is only {burst}")]
    ExceedsBurst {
        /// The number of tokens we asked for.
        requested: u64,
        /// The burst size at the time of the request.
        burst: u64,
    },

    /// The request could not have been satisfied before the deadline.
    ///
    /// No tokens were consumed.
    #[error("Cannot reserve {requested} tokens before the deadline")]
    WouldExceedDeadline {
        /// The number of tokens we asked for.
        requested: u64,
        /// When the tokens would have become available.
        ready_at: Instant,
    },
}

impl ReserveError {
    /// Return the number of tokens that the failed request asked for.
    pub fn requested(&self) -> u64 {
        match self {
            ReserveError::ExceedsBurst { requested, .. }
            | ReserveError::WouldExceedDeadline { requested, .. } => *requested,
        }
    }
}

/// An error returned by [`BoundedRetry::run`](crate::BoundedRetry::run)
/// once every attempt has failed.
#[derive(Clone, Debug, Error)]
#[error("Gave up after {attempts} attempts")]
pub struct RetryError<E> {
    /// How many times we tried.
    attempts: u32,
    /// The error from the last attempt.
    #[source]
    last: E,
}

impl<E> RetryError<E> {
    /// Construct a new `RetryError` from the error of the final attempt.
    pub(crate) fn new(attempts: u32, last: E) -> Self {
        RetryError { attempts, last }
    }

    /// Return the number of attempts that were made.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Return the error from the last attempt.
    pub fn last(&self) -> &E {
        &self.last
    }

    /// Consume this error, returning the error from the last attempt.
    pub fn into_last(self) -> E {
        self.last
    }
}

/// A read or write could not get permission from the rate limiter.
///
/// Returned (wrapped in a [`std::io::Error`] of kind `Other`) by
/// [`LimitedIo`](crate::LimitedIo) when every reservation attempt for a chunk
/// failed.  The stream itself is still usable; the caller may try again.
#[derive(Clone, Debug, Error)]
#[error(
    "Rate limiter exhausted: could not schedule {unscheduled} bytes after {attempts} attempts"
)]
pub struct LimiterExhausted {
    /// The size of the chunk that we could not schedule.
    unscheduled: u64,
    /// How many reservations we attempted.
    attempts: u32,
    /// Why the last reservation failed.
    #[source]
    cause: ReserveError,
}

impl LimiterExhausted {
    /// Return the number of bytes that could not be scheduled.
    pub fn unscheduled(&self) -> u64 {
        self.unscheduled
    }

    /// Return the number of reservations that were attempted.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// If `err` was caused by rate-limiter exhaustion, return the details.
    pub fn from_io(err: &std::io::Error) -> Option<&LimiterExhausted> {
        err.get_ref()?.downcast_ref::<LimiterExhausted>()
    }
}

impl From<RetryError<ReserveError>> for LimiterExhausted {
    fn from(err: RetryError<ReserveError>) -> Self {
        LimiterExhausted {
            unscheduled: err.last().requested(),
            attempts: err.attempts(),
            cause: err.into_last(),
        }
    }
}

impl From<LimiterExhausted> for std::io::Error {
    fn from(err: LimiterExhausted) -> std::io::Error {
        std::io::Error::other(err)
    }
}
