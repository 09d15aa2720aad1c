//! An AsyncRead/AsyncWrite wrapper that draws on a [`TokenBucket`].

use futures::io::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use qos_rtcompat::{NetStream, SleepProvider};
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::{BoundedRetry, Throttle, TokenBucket};

/// A byte stream whose reads and writes are limited by a shared
/// [`TokenBucket`].
///
/// Both directions draw on the same bucket.  Each call moves data in chunks
/// no larger than the bucket's rate at the moment the chunk is scheduled, so
/// a rate change takes effect at the next chunk boundary.
///
/// A write call moves as many chunks as it can without waiting; if it has
/// already moved some bytes when it would have to wait (or when the inner
/// stream fails), it returns the count so far, and the wait (or the error)
/// belongs to the next call.  A read call moves at most one chunk.
///
/// If the bucket's rate is zero, this type is a transparent passthrough.
#[pin_project]
pub struct LimitedIo<R: SleepProvider, T> {
    /// Throttle for bytes we read.
    read: Throttle<R>,
    /// Throttle for bytes we write.
    write: Throttle<R>,
    /// The stream we are limiting.
    #[pin]
    inner: T,
}

impl<R: SleepProvider, T> LimitedIo<R, T> {
    /// Wrap `inner` so that it draws on `bucket`.
    pub fn new(runtime: R, bucket: Arc<TokenBucket>, retry: BoundedRetry, inner: T) -> Self {
        LimitedIo {
            read: Throttle::new(runtime.clone(), Arc::clone(&bucket), retry),
            write: Throttle::new(runtime, bucket, retry),
            inner,
        }
    }

    /// Return the bucket that this stream draws on.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        self.write.bucket()
    }

    /// Return a reference to the wrapped stream.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Return a pinned mutable reference to the wrapped stream.
    pub fn inner_pin_mut(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }

    /// Unwrap this stream, discarding any tokens we were holding.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<R: SleepProvider, T: AsyncRead> AsyncRead for LimitedIo<R, T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        let grant = match this.read.poll_grant(cx, buf.len()) {
            Poll::Ready(Ok(g)) => g,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
            Poll::Pending => return Poll::Pending,
        };
        let n = grant.len();
        match this.inner.poll_read(cx, &mut buf[..n]) {
            Poll::Ready(Ok(got)) => {
                this.read.release(grant, got);
                Poll::Ready(Ok(got))
            }
            Poll::Ready(Err(e)) => {
                this.read.release(grant, 0);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                this.read.hold(grant);
                Poll::Pending
            }
        }
    }
}

/// Return `done` if it is nonzero; otherwise return `other`.
fn partial_or(done: usize, other: Poll<IoResult<usize>>) -> Poll<IoResult<usize>> {
    if done > 0 {
        Poll::Ready(Ok(done))
    } else {
        other
    }
}

impl<R: SleepProvider, T: AsyncWrite> AsyncWrite for LimitedIo<R, T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let mut this = self.project();
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }
        let mut done = 0;
        while done < buf.len() {
            let grant = match this.write.poll_grant(cx, buf.len() - done) {
                Poll::Ready(Ok(g)) => g,
                Poll::Ready(Err(e)) => {
                    return partial_or(done, Poll::Ready(Err(e.into())));
                }
                Poll::Pending if done > 0 => {
                    // Don't leave the bucket in debt for a chunk that the
                    // caller may never write.
                    this.write.cancel();
                    return Poll::Ready(Ok(done));
                }
                Poll::Pending => return Poll::Pending,
            };
            let n = grant.len();
            match this.inner.as_mut().poll_write(cx, &buf[done..done + n]) {
                Poll::Ready(Ok(wrote)) => {
                    this.write.release(grant, wrote);
                    done += wrote;
                    if wrote < n {
                        // Short write: the inner stream is full for now.
                        break;
                    }
                }
                Poll::Ready(Err(e)) => {
                    this.write.release(grant, 0);
                    return partial_or(done, Poll::Ready(Err(e)));
                }
                Poll::Pending if done > 0 => {
                    this.write.release(grant, 0);
                    return Poll::Ready(Ok(done));
                }
                Poll::Pending => {
                    this.write.hold(grant);
                    return Poll::Pending;
                }
            }
        }
        Poll::Ready(Ok(done))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl<R: SleepProvider, T: NetStream> NetStream for LimitedIo<R, T> {
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        self.inner.local_addr()
    }
}
