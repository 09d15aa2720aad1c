//! A stream wrapper that periodically logs how fast it is being written to.

use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::SpawnExt as _;
use pin_project::pin_project;
use qos_rtcompat::{NetStream, Runtime, SleepProvider};
use tracing::{debug, info, Instrument as _};
use void::Void;

use crate::err::QosError;

/// A stream that counts the bytes written to it, and logs the count at a
/// fixed interval.
///
/// Each report is an `info`-level event naming the remote address and the
/// throughput since the previous report.  Reporting stops when the stream is
/// closed or dropped, whichever happens first.
#[pin_project]
pub struct ThroughputLogged<S> {
    /// The stream we are measuring.
    #[pin]
    inner: S,
    /// Bytes written since the last report.
    written: Arc<AtomicU64>,
    /// Dropping this sender tells the reporter task to stop.
    ///
    /// (We never send anything on it.)
    stop: Option<oneshot::Sender<Void>>,
}

impl<S> ThroughputLogged<S> {
    /// Wrap `inner`, and launch a task on `runtime` that reports its
    /// throughput every `interval`.
    pub fn new<R: Runtime>(
        runtime: &R,
        inner: S,
        peer: SocketAddr,
        interval: Duration,
    ) -> Result<Self, QosError> {
        let written = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = oneshot::channel();
        runtime
            .spawn(report_throughput(
                runtime.clone(),
                peer,
                interval,
                Arc::clone(&written),
                stop_rx,
            )
            .in_current_span())
            .map_err(|e| QosError::from_spawn("throughput reporter", e))?;
        Ok(ThroughputLogged {
            inner,
            written,
            stop: Some(stop_tx),
        })
    }

    /// Return a reference to the wrapped stream.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

/// Log the bytes counted in `written` every `interval`, until `stop` is
/// cancelled.
async fn report_throughput<R: SleepProvider>(
    runtime: R,
    peer: SocketAddr,
    interval: Duration,
    written: Arc<AtomicU64>,
    mut stop: oneshot::Receiver<Void>,
) {
    let secs = interval.as_secs_f64();
    loop {
        match future::select(&mut stop, Box::pin(runtime.sleep(interval))).await {
            Either::Left(_) => break,
            Either::Right(((), _)) => {
                let n = written.swap(0, Ordering::Relaxed);
                let per_sec = (n as f64 / secs).round() as u64;
                info!("Connection[{}]::Current throughput is {} bytes/sec.", peer, per_sec);
            }
        }
    }
    debug!(%peer, "Throughput reporter stopped.");
}

impl<S: AsyncRead> AsyncRead for ThroughputLogged<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for ThroughputLogged<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = self.project();
        // Stop reporting.
        *this.stop = None;
        this.inner.poll_close(cx)
    }
}

impl<S: NetStream> NetStream for ThroughputLogged<S> {
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A stream that may or may not have a [`ThroughputLogged`] wrapper,
/// depending on how the listener was configured when it was accepted.
#[pin_project(project = MaybeLoggedProj)]
#[non_exhaustive]
pub enum MaybeLogged<S> {
    /// The stream, unchanged.
    Direct(#[pin] S),
    /// The stream, with throughput logging.
    Logged(#[pin] ThroughputLogged<S>),
}

impl<S> MaybeLogged<S> {
    /// Return true if this stream is logging its throughput.
    pub fn is_logged(&self) -> bool {
        matches!(self, MaybeLogged::Logged(_))
    }
}

impl<S: AsyncRead> AsyncRead for MaybeLogged<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        match self.project() {
            MaybeLoggedProj::Direct(s) => s.poll_read(cx, buf),
            MaybeLoggedProj::Logged(s) => s.poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for MaybeLogged<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        match self.project() {
            MaybeLoggedProj::Direct(s) => s.poll_write(cx, buf),
            MaybeLoggedProj::Logged(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.project() {
            MaybeLoggedProj::Direct(s) => s.poll_flush(cx),
            MaybeLoggedProj::Logged(s) => s.poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.project() {
            MaybeLoggedProj::Direct(s) => s.poll_close(cx),
            MaybeLoggedProj::Logged(s) => s.poll_close(cx),
        }
    }
}

impl<S: NetStream> NetStream for MaybeLogged<S> {
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        match self {
            MaybeLogged::Direct(s) => s.peer_addr(),
            MaybeLogged::Logged(s) => s.peer_addr(),
        }
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        match self {
            MaybeLogged::Direct(s) => s.local_addr(),
            MaybeLogged::Logged(s) => s.local_addr(),
        }
    }
}
