//! Declarations for traits that we need our runtimes to implement.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::Spawn;
use futures::Future;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A runtime that we can use to run the QoS layer's background tasks.
///
/// This trait comprises several other traits that we require all of our
/// runtimes to provide:
///
/// * [`futures::task::Spawn`] to launch new background tasks.
/// * [`SleepProvider`] to learn the time and to pause for a while.
///
/// It is implemented automatically for every type that provides both.
pub trait Runtime: SleepProvider + Spawn {}

impl<T> Runtime for T where T: SleepProvider + Spawn {}

/// Trait for a runtime that can wait until a timer has expired.
///
/// Every `SleepProvider` also has its own idea of the current time, so that
/// it can be replaced by a mock clock in tests.
pub trait SleepProvider: Clone + Send + Sync + 'static {
    /// A future returned by [`SleepProvider::sleep()`]
    type SleepFuture: Future<Output = ()> + Send + 'static;

    /// Return a future that will be ready after `duration` has elapsed.
    #[must_use = "sleep() returns a future, which does nothing unless used"]
    fn sleep(&self, duration: Duration) -> Self::SleepFuture;

    /// Return this runtime's view of the current instant.
    fn now(&self) -> Instant;

    /// Return a future that will be ready at `when`, or immediately if
    /// `when` has already passed.
    #[must_use = "sleep_until() returns a future, which does nothing unless used"]
    fn sleep_until(&self, when: Instant) -> Self::SleepFuture {
        self.sleep(when.saturating_duration_since(self.now()))
    }
}

/// A bidirectional byte stream that was accepted from a
/// [`NetStreamListener`].
///
/// Wrappers that decorate an accepted stream (throttling, accounting, ...)
/// implement this trait too, so that they can be nested freely.
pub trait NetStream: AsyncRead + AsyncWrite + Send + 'static {
    /// Return the address of the remote end of this stream.
    fn peer_addr(&self) -> IoResult<SocketAddr>;

    /// Return the local address of this stream.
    fn local_addr(&self) -> IoResult<SocketAddr>;
}

/// Trait for a local socket that accepts incoming streams.
#[async_trait]
pub trait NetStreamListener: Send + Sync + 'static {
    /// The type of streams returned by [`Self::accept()`].
    type Stream: NetStream;

    /// Wait for an incoming stream; return it along with its address.
    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)>;

    /// Return the local address that this listener is bound to.
    fn local_addr(&self) -> IoResult<SocketAddr>;
}
