//! A token bucket that can be reconfigured while it is in use.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use qos_rtcompat::SleepProvider;
use tracing::trace;

use crate::err::ReserveError;

/// The mutable part of a [`TokenBucket`].
#[derive(Clone, Debug)]
struct BucketState {
    /// How many tokens we add per second.  Zero means "unlimited".
    rate: u64,
    /// The most tokens that the bucket can hold.
    burst: u64,
    /// How many tokens the bucket held at `last`.
    ///
    /// This goes negative when reservations have been handed out that are
    /// not yet due: those tokens are owed to the bucket, and the next
    /// reservation has to wait for the debt to be repaid first.
    level: f64,
    /// When we last brought `level` up to date.
    last: Instant,
}

impl BucketState {
    /// Refill the bucket for the time that has elapsed since `last`.
    fn advance(&mut self, now: Instant) {
        let Some(elapsed) = now.checked_duration_since(self.last) else {
            // Time went backwards (or a caller is behind us); nothing to add.
            return;
        };
        self.last = now;
        let cap = self.burst as f64;
        if self.rate == 0 {
            self.level = cap;
            return;
        }
        self.level = (self.level + elapsed.as_secs_f64() * self.rate as f64).min(cap);
    }

    /// Take `n` tokens as of `now`, and return when they will have been
    /// earned.
    ///
    /// The caller must already have checked `n` against the burst size.
    fn take(&mut self, n: u64, now: Instant) -> Instant {
        self.level -= n as f64;
        self.ready_at(now)
    }

    /// Return the instant at which the current debt (if any) is repaid.
    fn ready_at(&self, now: Instant) -> Instant {
        if self.level >= 0.0 || self.rate == 0 {
            now
        } else {
            now + Duration::from_secs_f64(-self.level / self.rate as f64)
        }
    }
}

/// A token bucket, counted in bytes.
///
/// The bucket holds at most `burst` tokens and refills continuously at
/// `rate` tokens per second.  Callers [reserve](TokenBucket::reserve) tokens
/// ahead of time and are told when they may use them; reservations may run
/// the bucket into debt, so that a steady stream of requests is served in
/// order at exactly the configured rate.
///
/// A rate of zero means "do not throttle": every reservation is ready
/// immediately.  Stream wrappers should check [`TokenBucket::rate`] and skip
/// the bucket entirely in that case.
///
/// All methods take the current time explicitly, so that the bucket can be
/// driven by any [`SleepProvider`]'s clock.
#[derive(Debug)]
pub struct TokenBucket {
    /// The state of this bucket.
    inner: Mutex<BucketState>,
}

/// A successful reservation from a [`TokenBucket`].
///
/// The tokens have already been deducted from the bucket.  The holder may use
/// them once [`Reservation::ready_at`] has passed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub struct Reservation {
    /// How many tokens we reserved.
    n: u64,
    /// When they become usable.
    ready_at: Instant,
}

impl Reservation {
    /// Return the number of tokens in this reservation.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Return the instant at which the tokens may be used.
    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// Return how long a caller has to wait, as of `now`.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.ready_at.saturating_duration_since(now)
    }
}

impl TokenBucket {
    /// Create a new, full bucket.
    pub fn new(rate: u64, burst: u64, now: Instant) -> Self {
        TokenBucket {
            inner: Mutex::new(BucketState {
                rate,
                burst,
                level: burst as f64,
                last: now,
            }),
        }
    }

    /// Return the current rate, in tokens per second.
    pub fn rate(&self) -> u64 {
        self.inner.lock().expect("poisoned lock").rate
    }

    /// Return the current burst size.
    pub fn burst(&self) -> u64 {
        self.inner.lock().expect("poisoned lock").burst
    }

    /// Return the number of tokens in the bucket at `now`.
    ///
    /// Negative values mean that outstanding reservations have not yet been
    /// paid for.
    pub fn level(&self, now: Instant) -> f64 {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.level
    }

    /// Reserve `n` tokens.
    ///
    /// On success the tokens are committed, and the returned reservation says
    /// when they may be used.  Fails if `n` is larger than the burst size,
    /// since such a request could never be satisfied.
    pub fn reserve(&self, n: u64, now: Instant) -> Result<Reservation, ReserveError> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        if inner.rate == 0 {
            return Ok(Reservation { n, ready_at: now });
        }
        if n > inner.burst {
            return Err(ReserveError::ExceedsBurst {
                requested: n,
                burst: inner.burst,
            });
        }
        let ready_at = inner.take(n, now);
        trace!(n, level = inner.level, "reserved tokens");
        Ok(Reservation { n, ready_at })
    }

    /// Reserve `n` tokens, but only if they will be available by `deadline`.
    ///
    /// If they would not be, nothing is consumed and
    /// [`ReserveError::WouldExceedDeadline`] is returned.
    pub fn reserve_before(
        &self,
        n: u64,
        now: Instant,
        deadline: Instant,
    ) -> Result<Reservation, ReserveError> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        if inner.rate == 0 {
            return Ok(Reservation { n, ready_at: now });
        }
        if n > inner.burst {
            return Err(ReserveError::ExceedsBurst {
                requested: n,
                burst: inner.burst,
            });
        }
        let ready_at = inner.take(n, now);
        if ready_at > deadline {
            inner.level += n as f64;
            return Err(ReserveError::WouldExceedDeadline {
                requested: n,
                ready_at,
            });
        }
        Ok(Reservation { n, ready_at })
    }

    /// Return `n` unused tokens to the bucket.
    ///
    /// This can violate our limits unless the tokens were previously
    /// reserved and never used.
    pub fn put_back(&self, n: u64, now: Instant) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.level = (inner.level + n as f64).min(inner.burst as f64);
    }

    /// Change the refill rate.
    ///
    /// Tokens earned at the old rate up to `now` are kept.  Reservations that
    /// were already handed out keep their original ready time.
    pub fn set_rate(&self, rate: u64, now: Instant) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.rate = rate;
    }

    /// Change the burst size.
    ///
    /// If the bucket holds more than the new burst size, the excess is lost.
    pub fn set_burst(&self, burst: u64, now: Instant) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.burst = burst;
        inner.level = inner.level.min(burst as f64);
    }

    /// Throw away every token in the bucket.
    ///
    /// Outstanding debt is kept.
    pub fn drain(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.level = inner.level.min(0.0);
    }

    /// Change the burst size to `burst`, but make sure that a full burst
    /// cannot be available before `at`.
    ///
    /// Requests of up to `burst` tokens are accepted at once; the bucket
    /// level is lowered (never raised) so that refilling at the current rate
    /// reaches `burst` no earlier than `at`.  With `at` one second away and
    /// `burst == rate`, this makes a new bucket start empty, which avoids a
    /// double-rate spike when traffic first starts flowing.
    pub fn schedule_burst_at(&self, at: Instant, burst: u64, now: Instant) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.advance(now);
        inner.burst = burst;
        let pending = at.saturating_duration_since(now).as_secs_f64() * inner.rate as f64;
        let ceiling = (burst as f64 - pending).max(0.0);
        inner.level = inner.level.min(ceiling);
        trace!(burst, level = inner.level, "scheduled burst");
    }

    /// Wait until `n` tokens are available, and consume them.
    ///
    /// If this future is dropped before it completes, the reservation is
    /// cancelled and its tokens are returned to the bucket.
    pub async fn acquire<R: SleepProvider>(&self, runtime: &R, n: u64) -> Result<(), ReserveError> {
        let reservation = self.reserve(n, runtime.now())?;
        self.wait_for(runtime, reservation).await;
        Ok(())
    }

    /// As [`TokenBucket::acquire`], but fail at once, without consuming
    /// anything, if the tokens could not be available by `deadline`.
    pub async fn acquire_before<R: SleepProvider>(
        &self,
        runtime: &R,
        n: u64,
        deadline: Instant,
    ) -> Result<(), ReserveError> {
        let reservation = self.reserve_before(n, runtime.now(), deadline)?;
        self.wait_for(runtime, reservation).await;
        Ok(())
    }

    /// Sleep until `reservation` is ready, returning its tokens if we are
    /// cancelled first.
    async fn wait_for<R: SleepProvider>(&self, runtime: &R, reservation: Reservation) {
        let mut pending = PendingReservation {
            bucket: self,
            runtime,
            n: Some(reservation.n),
        };
        if reservation.ready_at > runtime.now() {
            runtime.sleep_until(reservation.ready_at).await;
        }
        pending.n = None;
    }
}

/// A reservation that we are still waiting for.
///
/// If this is dropped while `n` is still set, the tokens go back into the
/// bucket.
struct PendingReservation<'a, R: SleepProvider> {
    /// The bucket we reserved from.
    bucket: &'a TokenBucket,
    /// The clock to use when returning tokens.
    runtime: &'a R,
    /// The number of tokens, if the reservation has not yet completed.
    n: Option<u64>,
}

impl<'a, R: SleepProvider> Drop for PendingReservation<'a, R> {
    fn drop(&mut self) {
        if let Some(n) = self.n.take() {
            trace!(n, "reservation cancelled");
            self.bucket.put_back(n, self.runtime.now());
        }
    }
}
