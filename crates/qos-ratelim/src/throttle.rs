//! Poll-level access to a [`TokenBucket`], for use inside `poll_read` and
//! `poll_write` implementations.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use qos_rtcompat::SleepProvider;
use tracing::trace;

use crate::err::{LimiterExhausted, ReserveError, RetryError};
use crate::{BoundedRetry, Reservation, TokenBucket};

/// Permission to move some number of bytes.
///
/// Returned by [`Throttle::poll_grant`].  Must be handed back to the
/// throttle with [`Throttle::release`] once the I/O has happened, or with
/// [`Throttle::hold`] if the I/O could not happen yet.
#[derive(Debug)]
#[must_use]
pub struct Grant {
    /// The number of bytes we may move.
    n: usize,
    /// True if these bytes were paid for with tokens from the bucket.
    metered: bool,
}

impl Grant {
    /// Return the number of bytes that this grant allows.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Return true if this grant allows nothing.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

/// Reserve up to `want` tokens from `bucket`, in one chunk no larger than
/// its rate, retrying as `retry` allows.
///
/// The rate is read afresh on every attempt; `before_reserve` runs after it
/// is read and before the bucket is asked.  Returns `None` if the bucket is
/// (or has become) unlimited.
fn reserve_chunk<F>(
    bucket: &TokenBucket,
    retry: BoundedRetry,
    want: usize,
    now: Instant,
    mut before_reserve: F,
) -> Result<Option<Reservation>, RetryError<ReserveError>>
where
    F: FnMut(u32),
{
    retry.run(|attempt| {
        let limit = bucket.rate();
        if limit == 0 {
            return Ok(None);
        }
        before_reserve(attempt);
        bucket.reserve(limit.min(want as u64), now).map(Some)
    })
}

/// Where a [`Throttle`] is in its cycle.
enum State<F> {
    /// No reservation outstanding.
    Idle,
    /// We hold a reservation for `n` tokens that becomes ready when `sleep`
    /// resolves.
    Waiting {
        /// The reserved token count.
        n: u64,
        /// Resolves when the reservation is ready.
        sleep: Pin<Box<F>>,
    },
    /// We hold `n` tokens that are ready to use.
    Ready(u64),
}

/// One direction of a rate-limited stream.
///
/// A `Throttle` turns "I would like to move `want` bytes" into a series of
/// grants, each no larger than the bucket's *current* rate.  Every
/// reservation goes through a [`BoundedRetry`]: if the bucket rejects a
/// request (because its burst size shrank after we looked at the rate), we
/// re-read the rate and try again with a smaller request, up to the policy's
/// limit.
///
/// Several throttles may share one bucket; typically a stream has one for
/// reading and one for writing.
pub struct Throttle<R: SleepProvider> {
    /// Our clock, and the source of our sleep futures.
    runtime: R,
    /// The bucket we take tokens from.
    bucket: Arc<TokenBucket>,
    /// How hard to try when a reservation fails.
    retry: BoundedRetry,
    /// Current state.
    state: State<R::SleepFuture>,
}

impl<R: SleepProvider> Throttle<R> {
    /// Create a new throttle drawing on `bucket`.
    pub fn new(runtime: R, bucket: Arc<TokenBucket>, retry: BoundedRetry) -> Self {
        Throttle {
            runtime,
            bucket,
            retry,
            state: State::Idle,
        }
    }

    /// Return the bucket that this throttle draws on.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Try to get permission to move up to `want` bytes.
    ///
    /// Returns `Pending` while we wait for a reservation to come due; the
    /// waker in `cx` is woken when it does.  The returned grant may be smaller
    /// than `want`, but is never larger, and never empty unless `want` is
    /// zero.
    pub fn poll_grant(
        &mut self,
        cx: &mut Context<'_>,
        want: usize,
    ) -> Poll<Result<Grant, LimiterExhausted>> {
        loop {
            match &mut self.state {
                State::Idle => {
                    if want == 0 || self.bucket.rate() == 0 {
                        return Poll::Ready(Ok(Grant {
                            n: want,
                            metered: false,
                        }));
                    }
                    let now = self.runtime.now();
                    match reserve_chunk(&self.bucket, self.retry, want, now, |_| ()) {
                        Ok(None) => {
                            return Poll::Ready(Ok(Grant {
                                n: want,
                                metered: false,
                            }))
                        }
                        Ok(Some(r)) if r.ready_at() <= now => self.state = State::Ready(r.n()),
                        Ok(Some(r)) => {
                            trace!(n = r.n(), delay = ?r.delay_from(now), "waiting for tokens");
                            self.state = State::Waiting {
                                n: r.n(),
                                sleep: Box::pin(self.runtime.sleep_until(r.ready_at())),
                            };
                        }
                        Err(e) => return Poll::Ready(Err(e.into())),
                    }
                }
                State::Waiting { n, sleep } => {
                    let n = *n;
                    ready!(sleep.as_mut().poll(cx));
                    self.state = State::Ready(n);
                }
                State::Ready(n) => {
                    let mut n = *n;
                    self.state = State::Idle;
                    let want = want as u64;
                    if n > want {
                        // The caller's buffer shrank since we reserved.
                        self.bucket.put_back(n - want, self.runtime.now());
                        n = want;
                    }
                    if n == 0 {
                        continue;
                    }
                    return Poll::Ready(Ok(Grant {
                        // n <= want, which came from a usize.
                        n: n as usize,
                        metered: true,
                    }));
                }
            }
        }
    }

    /// Report that `used` bytes of `grant` were actually moved.
    ///
    /// Any unused part of a metered grant goes back into the bucket.
    pub fn release(&mut self, grant: Grant, used: usize) {
        debug_assert!(used <= grant.n);
        if grant.metered && used < grant.n {
            self.bucket
                .put_back((grant.n - used) as u64, self.runtime.now());
        }
    }

    /// Keep `grant` for the next call to [`Throttle::poll_grant`].
    ///
    /// Use this when the underlying stream was not ready, so that we don't pay
    /// for the same bytes twice.
    pub fn hold(&mut self, grant: Grant) {
        if grant.metered && grant.n > 0 {
            self.state = State::Ready(grant.n as u64);
        }
    }

    /// Give up any reservation we are waiting on or holding, and return its
    /// tokens to the bucket.
    pub fn cancel(&mut self) {
        match mem::replace(&mut self.state, State::Idle) {
            State::Waiting { n, .. } | State::Ready(n) => {
                trace!(n, "reservation cancelled");
                self.bucket.put_back(n, self.runtime.now());
            }
            State::Idle => {}
        }
    }
}

impl<R: SleepProvider> Drop for Throttle<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}
