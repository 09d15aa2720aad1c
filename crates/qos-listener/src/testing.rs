//! In-memory streams and listeners for tests.

use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite, Cursor};
use futures::StreamExt as _;
use qos_rtcompat::{NetStream, NetStreamListener};

/// Everything written to a [`MockStream`].
pub(crate) type Output = Arc<Mutex<Vec<u8>>>;

/// What a [`MockListener`] hands out from `accept`.
pub(crate) type Accepted = IoResult<(MockStream, SocketAddr)>;

/// The address that every mock listener pretends to be bound to.
pub(crate) fn local() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

/// A stream that reads from a fixed buffer and records what is written.
#[derive(Debug)]
pub(crate) struct MockStream {
    /// The pretend remote address.
    peer: SocketAddr,
    /// Data to hand out from reads.
    input: Cursor<Vec<u8>>,
    /// Data written so far.
    output: Output,
}

impl MockStream {
    /// Make a stream from `127.0.0.1:port` with nothing to read.
    pub(crate) fn new(port: u16) -> (Self, Output) {
        Self::with_input(port, Vec::new())
    }

    /// Make a stream from `127.0.0.1:port` that will yield `input`.
    pub(crate) fn with_input(port: u16, input: Vec<u8>) -> (Self, Output) {
        let output = Output::default();
        let s = MockStream {
            peer: SocketAddr::from(([127, 0, 0, 1], port)),
            input: Cursor::new(input),
            output: Arc::clone(&output),
        };
        (s, output)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        self.output.lock().expect("poisoned lock").extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }
}

impl NetStream for MockStream {
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        Ok(local())
    }
}

/// A listener whose connections (and failures) are fed to it through a
/// channel.
pub(crate) struct MockListener {
    /// Where accepted streams come from.
    incoming: futures::lock::Mutex<mpsc::UnboundedReceiver<Accepted>>,
}

impl MockListener {
    /// Make a new listener, and a sender to feed it with.
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<Accepted>) {
        let (tx, rx) = mpsc::unbounded();
        let lis = MockListener {
            incoming: futures::lock::Mutex::new(rx),
        };
        (lis, tx)
    }
}

/// Feed a stream from `127.0.0.1:port` to a mock listener.
pub(crate) fn connect(tx: &mpsc::UnboundedSender<Accepted>, port: u16) -> Output {
    let (s, output) = MockStream::new(port);
    let peer = s.peer;
    tx.unbounded_send(Ok((s, peer)))
        .expect("mock listener went away");
    output
}

#[async_trait]
impl NetStreamListener for MockListener {
    type Stream = MockStream;

    async fn accept(&self) -> IoResult<(MockStream, SocketAddr)> {
        match self.incoming.lock().await.next().await {
            Some(accepted) => accepted,
            None => Err(std::io::Error::other("mock listener has no more streams")),
        }
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        Ok(local())
    }
}
