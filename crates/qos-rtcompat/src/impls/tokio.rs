//! Re-exports of the tokio runtime for use with the QoS listener.
//!
//! This module helps define a slim API around our async runtime so that we
//! can easily swap it out.

/// Types used for networking (tokio implementation)
pub(crate) mod net {
    use crate::traits;
    use async_trait::async_trait;

    pub(crate) use tokio_crate::net::{
        TcpListener as TokioTcpListener, TcpStream as TokioTcpStream,
    };

    use futures::io::{AsyncRead, AsyncWrite};
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};

    use std::io::Result as IoResult;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Wrapper for Tokio's TcpStream that implements the standard
    /// AsyncRead and AsyncWrite.
    #[derive(Debug)]
    pub struct TcpStream {
        /// Underlying tokio_util::compat::Compat wrapper.
        s: Compat<TokioTcpStream>,
    }
    impl From<TokioTcpStream> for TcpStream {
        fn from(s: TokioTcpStream) -> TcpStream {
            let s = s.compat();
            TcpStream { s }
        }
    }
    impl TcpStream {
        /// Open a TCP connection to `addr`.
        pub async fn connect(addr: &SocketAddr) -> IoResult<Self> {
            let s = TokioTcpStream::connect(addr).await?;
            Ok(s.into())
        }
    }
    impl AsyncRead for TcpStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<IoResult<usize>> {
            Pin::new(&mut self.s).poll_read(cx, buf)
        }
    }
    impl AsyncWrite for TcpStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<IoResult<usize>> {
            Pin::new(&mut self.s).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Pin::new(&mut self.s).poll_flush(cx)
        }
        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Pin::new(&mut self.s).poll_close(cx)
        }
    }
    impl traits::NetStream for TcpStream {
        fn peer_addr(&self) -> IoResult<SocketAddr> {
            self.s.get_ref().peer_addr()
        }
        fn local_addr(&self) -> IoResult<SocketAddr> {
            self.s.get_ref().local_addr()
        }
    }

    /// Wrap a Tokio TcpListener to behave as a [`NetStreamListener`](traits::NetStreamListener).
    #[derive(Debug)]
    pub struct TcpListener {
        /// The underlying listener.
        pub(super) lis: TokioTcpListener,
    }

    impl TcpListener {
        /// Bind a new listener to `addr`.
        pub async fn bind(addr: &SocketAddr) -> IoResult<Self> {
            let lis = TokioTcpListener::bind(*addr).await?;
            Ok(TcpListener { lis })
        }
    }

    impl From<TokioTcpListener> for TcpListener {
        fn from(lis: TokioTcpListener) -> TcpListener {
            TcpListener { lis }
        }
    }

    #[async_trait]
    impl traits::NetStreamListener for TcpListener {
        type Stream = TcpStream;
        async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)> {
            let (stream, addr) = self.lis.accept().await?;
            Ok((stream.into(), addr))
        }
        fn local_addr(&self) -> IoResult<SocketAddr> {
            self.lis.local_addr()
        }
    }
}

// ==============================

use crate::traits::*;
use std::io::Result as IoResult;
use std::time::{Duration, Instant};

impl SleepProvider for TokioRuntimeHandle {
    type SleepFuture = tokio_crate::time::Sleep;
    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        tokio_crate::time::sleep(duration)
    }
    fn now(&self) -> Instant {
        // Go through tokio's clock, so that a paused clock is honoured.
        tokio_crate::time::Instant::now().into_std()
    }
}

/// Wrapper around a Handle to a tokio runtime.
///
/// Ideally, this type would go away, and we would just use
/// `tokio::runtime::Handle` directly.  Unfortunately, we can't implement
/// `futures::Spawn` on it ourselves because of Rust's orphan rules, so we need
/// to define a new type here.
///
/// # Limitations
///
/// Note that we require that the runtime should have working implementations
/// for Tokio's time, net, and io facilities, but we have no good way to check
/// that when creating this object.
#[derive(Clone, Debug)]
pub struct TokioRuntimeHandle {
    /// The underlying Handle.
    handle: tokio_crate::runtime::Handle,
}

impl TokioRuntimeHandle {
    /// Return a handle to the tokio runtime we are currently running in.
    ///
    /// Fails if we are not inside a tokio runtime.
    pub fn current() -> IoResult<Self> {
        let handle = tokio_crate::runtime::Handle::try_current().map_err(std::io::Error::other)?;
        Ok(handle.into())
    }
}

impl From<tokio_crate::runtime::Handle> for TokioRuntimeHandle {
    fn from(handle: tokio_crate::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl futures::task::Spawn for TokioRuntimeHandle {
    fn spawn_obj(
        &self,
        future: futures::task::FutureObj<'static, ()>,
    ) -> Result<(), futures::task::SpawnError> {
        let join_handle = self.handle.spawn(future);
        drop(join_handle); // this makes the task detached.
        Ok(())
    }
}
