//! The throttled stream handed out by a [`QosListener`](crate::QosListener).

use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::SpawnExt as _;
use pin_project::pin_project;
use qos_ratelim::{BoundedRetry, LimitedIo, TokenBucket};
use qos_rtcompat::{NetStream, Runtime, SleepProvider};
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::err::QosError;
use crate::state::ConnId;

/// Tells the listener, exactly once, that a stream has gone away.
#[derive(Debug)]
pub(crate) struct CloseNotify {
    /// The identity of our stream, as the listener knows it.
    conn: ConnId,
    /// Where to send the notification; `None` once it has been sent.
    tx: Option<mpsc::UnboundedSender<ConnId>>,
}

impl CloseNotify {
    /// Make a notifier that will report `conn` on `tx`.
    pub(crate) fn new(conn: ConnId, tx: mpsc::UnboundedSender<ConnId>) -> Self {
        CloseNotify { conn, tx: Some(tx) }
    }

    /// Send the notification, if we haven't already.
    fn notify(&mut self) {
        if let Some(tx) = self.tx.take() {
            if tx.unbounded_send(self.conn).is_err() {
                warn!(conn = %self.conn, "Listener is gone; could not report closed stream");
            }
        }
    }
}

impl Drop for CloseNotify {
    fn drop(&mut self) {
        self.notify();
    }
}

/// Build the token bucket for a newly accepted connection.
///
/// The bucket starts out allowing `limit` bytes per second, but cannot hold
/// a full burst until `burst_delay` has passed.
pub(crate) fn new_bucket<R: SleepProvider>(
    runtime: &R,
    limit: u64,
    burst_delay: Duration,
) -> Arc<TokenBucket> {
    let now = runtime.now();
    let bucket = TokenBucket::new(limit, limit, now);
    match now.checked_add(burst_delay) {
        Some(at) => bucket.schedule_burst_at(at, limit, now),
        // Further away than the clock can count: start empty.
        None => bucket.drain(now),
    }
    Arc::new(bucket)
}

/// Launch a task that applies every new limit from `updates` to `bucket`.
///
/// The task ends when the sending side of `updates` is dropped.
pub(crate) fn spawn_limit_updater<R: Runtime>(
    runtime: &R,
    conn: ConnId,
    bucket: Arc<TokenBucket>,
    updates: watch::Receiver<u64>,
) -> Result<(), QosError> {
    runtime
        .spawn(apply_limit_updates(runtime.clone(), conn, bucket, updates))
        .map_err(|e| QosError::from_spawn("limit update task", e))
}

/// Body of the task launched by [`spawn_limit_updater`].
async fn apply_limit_updates<R: SleepProvider>(
    runtime: R,
    conn: ConnId,
    bucket: Arc<TokenBucket>,
    mut updates: watch::Receiver<u64>,
) {
    while updates.changed().await.is_ok() {
        let limit = *updates.borrow_and_update();
        if bucket.rate() != limit {
            let now = runtime.now();
            bucket.set_rate(limit, now);
            bucket.set_burst(limit, now);
            trace!(%conn, limit, "applied new limit");
        }
    }
    trace!(%conn, "limit update task done");
}

/// A stream accepted by a [`QosListener`](crate::QosListener).
///
/// Reads and writes are throttled to the listener's current per-connection
/// allowance.  The allowance can change at any time (when limits are
/// reconfigured, or connections come and go); the new value applies from the
/// next chunk onward, and bytes that have already moved are never charged
/// again.
///
/// A call that finds that the rate limiter cannot schedule its data fails
/// with an I/O error for which [`is_limiter_exhausted`](crate::is_limiter_exhausted)
/// returns true.  That only happens when the limits change repeatedly while
/// the call is in progress; the stream is still usable afterwards.
///
/// Closing or dropping this stream removes it from the listener.
#[pin_project]
pub struct QosStream<R: SleepProvider, S> {
    /// The wrapped stream, with throttling.
    #[pin]
    io: LimitedIo<R, S>,
    /// Our remote address.
    peer: SocketAddr,
    /// Tells the listener when we close.
    close: CloseNotify,
}

impl<R: SleepProvider, S> QosStream<R, S> {
    /// Wrap `inner`, drawing on `bucket`.
    pub(crate) fn new(
        runtime: R,
        inner: S,
        bucket: Arc<TokenBucket>,
        retry: BoundedRetry,
        close: CloseNotify,
    ) -> Self {
        QosStream {
            io: LimitedIo::new(runtime, bucket, retry, inner),
            peer: close.conn.addr(),
            close,
        }
    }

    /// Return the remote address that the listener knows this stream by.
    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Return the rate limit that currently applies to this stream, in bytes
    /// per second.  Zero means "unlimited".
    pub fn limit(&self) -> u64 {
        self.io.bucket().rate()
    }

    /// Return a reference to the wrapped stream.
    pub fn inner(&self) -> &S {
        self.io.inner()
    }
}

impl<R: SleepProvider, S: AsyncRead> AsyncRead for QosStream<R, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        self.project().io.poll_read(cx, buf)
    }
}

impl<R: SleepProvider, S: AsyncWrite> AsyncWrite for QosStream<R, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = self.project();
        this.close.notify();
        this.io.poll_close(cx)
    }
}

impl<R: SleepProvider, S: NetStream> NetStream for QosStream<R, S> {
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.io.peer_addr()
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        self.io.local_addr()
    }
}
