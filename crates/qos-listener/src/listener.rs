//! The QoS listener itself, and a handle for reconfiguring it.

use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, Stream, StreamExt as _};
use futures::task::SpawnExt as _;
use qos_rtcompat::{NetStreamListener, Runtime};
use tokio::sync::watch;
use tracing::{debug, Instrument as _};

use crate::config::QosConfig;
use crate::err::QosError;
use crate::logging::{MaybeLogged, ThroughputLogged};
use crate::state::{ConnId, QosState, QosStatus, SharedState};
use crate::stream::{new_bucket, spawn_limit_updater, CloseNotify, QosStream};

/// The type of stream returned by a [`QosListener`] that wraps a listener
/// whose streams have type `S`.
pub type AcceptedStream<R, S> = QosStream<R, MaybeLogged<S>>;

/// A wrapper around a [`NetStreamListener`] that throttles every stream it
/// accepts.
///
/// Two limits apply, both in bytes per second and both optional (zero means
/// "no limit"): a limit for each connection, and a global limit that is
/// split evenly between all the connections that are currently open.  Each
/// connection gets the smaller of the two.  Whenever a connection is
/// accepted or closed, or a limit changes, the listener recomputes the
/// allowance and pushes it to every open connection.
///
/// The limits can be changed from other tasks through a [`QosHandle`].
pub struct QosListener<R: Runtime, L: NetStreamListener> {
    /// Used to spawn tasks and to read the time.
    runtime: R,
    /// The listener we wrap; `None` once we are closed.
    listener: Option<L>,
    /// Configuration that applies to every accepted stream.
    config: QosConfig,
    /// The limits, and every open connection.
    state: SharedState,
    /// A sender that each new stream clones to report its closure.
    ///
    /// Dropped when we close, so that the task that handles closures can
    /// end once every stream is gone.
    close_tx: Option<mpsc::UnboundedSender<ConnId>>,
}

/// A cloneable handle for changing the limits of a [`QosListener`].
#[derive(Clone, Debug)]
pub struct QosHandle {
    /// The listener's state.
    state: SharedState,
}

impl<R: Runtime, L: NetStreamListener> QosListener<R, L> {
    /// Wrap `listener`, with no limits.
    pub fn new(runtime: R, listener: L) -> Result<Self, QosError> {
        Self::with_config(runtime, listener, &QosConfig::default())
    }

    /// Wrap `listener`, taking initial limits and other settings from
    /// `config`.
    ///
    /// Launches a background task on `runtime` to process stream closures.
    pub fn with_config(runtime: R, listener: L, config: &QosConfig) -> Result<Self, QosError> {
        let state = Arc::new(Mutex::new(QosState::new(
            config.limit_per_conn(),
            config.limit_global(),
            config.log_throughput(),
        )));
        let (close_tx, close_rx) = mpsc::unbounded();
        runtime
            .spawn(process_closures(Arc::clone(&state), close_rx).in_current_span())
            .map_err(|e| QosError::from_spawn("close notification task", e))?;
        Ok(QosListener {
            runtime,
            listener: Some(listener),
            config: config.clone(),
            state,
            close_tx: Some(close_tx),
        })
    }

    /// Return a handle that can be used to reconfigure this listener.
    pub fn handle(&self) -> QosHandle {
        QosHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Wait for a new connection, and return it wrapped in a [`QosStream`],
    /// along with its remote address.
    ///
    /// Errors from the underlying listener are returned unchanged, and leave
    /// our state untouched.  Our own errors are returned as a [`QosError`]
    /// inside an [`std::io::Error`].
    pub async fn accept(&self) -> IoResult<(AcceptedStream<R, L::Stream>, SocketAddr)> {
        let (listener, close_tx) = match (&self.listener, &self.close_tx) {
            (Some(l), Some(tx)) => (l, tx),
            _ => return Err(QosError::ListenerClosed.into()),
        };
        let (stream, addr) = listener.accept().await?;
        Ok((self.register(stream, addr, close_tx)?, addr))
    }

    /// Wrap a freshly accepted `stream` from `addr`, add it to our state,
    /// and rebalance.
    fn register(
        &self,
        stream: L::Stream,
        addr: SocketAddr,
        close_tx: &mpsc::UnboundedSender<ConnId>,
    ) -> Result<AcceptedStream<R, L::Stream>, QosError> {
        let mut state = self.state.lock().expect("poisoned lock");
        let conn = state.new_conn_id(addr);

        let stream = if state.log_throughput() {
            MaybeLogged::Logged(ThroughputLogged::new(
                &self.runtime,
                stream,
                addr,
                self.config.log_interval(),
            )?)
        } else {
            MaybeLogged::Direct(stream)
        };

        let limit = state.limit_for_new_conn();
        let bucket = new_bucket(&self.runtime, limit, self.config.burst_delay());
        let (updates_tx, updates_rx) = watch::channel(limit);
        spawn_limit_updater(&self.runtime, conn, Arc::clone(&bucket), updates_rx)?;

        let stream = QosStream::new(
            self.runtime.clone(),
            stream,
            bucket,
            self.config.retry(),
            CloseNotify::new(conn, close_tx.clone()),
        );
        state.insert(conn, updates_tx);
        Ok(stream)
    }

    /// Return a stream of accepted connections.
    ///
    /// The stream ends if this listener is closed.
    pub fn incoming(
        &self,
    ) -> impl Stream<Item = IoResult<(AcceptedStream<R, L::Stream>, SocketAddr)>> + '_ {
        stream::unfold(self, |lis| async move {
            if lis.listener.is_none() {
                return None;
            }
            Some((lis.accept().await, lis))
        })
    }

    /// Return the address that the underlying listener is bound to.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        match &self.listener {
            Some(l) => l.local_addr(),
            None => Err(QosError::ListenerClosed.into()),
        }
    }

    /// Stop accepting connections, and close the underlying listener.
    ///
    /// Streams that were already accepted keep working, and are still
    /// rebalanced as they close.
    pub fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!("closing listener");
        }
        self.close_tx = None;
    }

    /// Change the per-connection limit; see [`QosHandle::set_limit_per_conn`].
    pub fn set_limit_per_conn(&self, limit: u64) {
        self.handle().set_limit_per_conn(limit);
    }

    /// Change the global limit; see [`QosHandle::set_limit_global`].
    pub fn set_limit_global(&self, limit: u64) {
        self.handle().set_limit_global(limit);
    }

    /// Turn on throughput logging; see
    /// [`QosHandle::enable_throughput_logging`].
    pub fn enable_throughput_logging(&self) {
        self.handle().enable_throughput_logging();
    }

    /// Describe the current state of this listener.
    pub fn status(&self) -> QosStatus {
        self.handle().status()
    }
}

/// Remove each stream that `closed` reports, and rebalance.
///
/// Returns once every sender (the listener's, and each open stream's) has
/// been dropped.
async fn process_closures(state: SharedState, mut closed: mpsc::UnboundedReceiver<ConnId>) {
    while let Some(conn) = closed.next().await {
        state.lock().expect("poisoned lock").remove(&conn);
    }
    debug!("Listener closed and all its streams are gone.");
}

#[async_trait]
impl<R: Runtime, L: NetStreamListener> NetStreamListener for QosListener<R, L> {
    type Stream = AcceptedStream<R, L::Stream>;

    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)> {
        QosListener::accept(self).await
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        QosListener::local_addr(self)
    }
}

impl QosHandle {
    /// Change the most bytes per second that any one connection may move.
    /// Zero means "no per-connection limit".
    ///
    /// Every open connection is told its new allowance at once; it applies
    /// from each connection's next chunk.
    pub fn set_limit_per_conn(&self, limit: u64) {
        self.state
            .lock()
            .expect("poisoned lock")
            .set_limit_per_conn(limit);
    }

    /// Change the most bytes per second that all connections together may
    /// move.  Zero means "no global limit".
    pub fn set_limit_global(&self, limit: u64) {
        self.state
            .lock()
            .expect("poisoned lock")
            .set_limit_global(limit);
    }

    /// Log the throughput of every connection accepted from now on.
    ///
    /// Connections that are already open are not affected.
    pub fn enable_throughput_logging(&self) {
        self.state
            .lock()
            .expect("poisoned lock")
            .enable_throughput_logging();
    }

    /// Describe the current state of the listener.
    pub fn status(&self) -> QosStatus {
        self.state.lock().expect("poisoned lock").status()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::testing::{connect, MockListener};
    use assert_matches::assert_matches;
    use futures::io::AsyncWriteExt as _;
    use qos_rtcompat::tokio::TokioRuntimeHandle;
    use qos_rtcompat::{NetStream as _, SleepProvider as _};
    use std::io;
    use std::time::Duration;
    use tracing_test::traced_test;

    const MIB: u64 = 1 << 20;

    /// Let every background task catch up.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Make a listener over a mock, returning it and the mock's feed.
    fn listener(
        config: &QosConfig,
    ) -> (
        QosListener<TokioRuntimeHandle, MockListener>,
        mpsc::UnboundedSender<crate::testing::Accepted>,
    ) {
        let rt = TokioRuntimeHandle::current().unwrap();
        let (mock, feed) = MockListener::new();
        (QosListener::with_config(rt, mock, config).unwrap(), feed)
    }

    #[tokio::test(start_paused = true)]
    async fn rebalance_on_churn() {
        let (lis, feed) = listener(&QosConfig::default());
        lis.set_limit_per_conn(2 * MIB);

        connect(&feed, 1);
        let (mut a, addr_a) = lis.accept().await.unwrap();
        assert_eq!(addr_a.port(), 1);
        settle().await;
        assert_eq!(a.limit(), 2 * MIB);

        connect(&feed, 2);
        let (b, _) = lis.accept().await.unwrap();
        settle().await;
        assert_eq!(a.limit(), 2 * MIB);
        assert_eq!(b.limit(), 2 * MIB);

        lis.set_limit_global(MIB);
        settle().await;
        assert_eq!(a.limit(), MIB / 2);
        assert_eq!(b.limit(), MIB / 2);

        a.close().await.unwrap();
        settle().await;
        assert_eq!(b.limit(), MIB);
        let status = lis.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.actual_limit_per_conn, MIB);
    }

    #[tokio::test(start_paused = true)]
    async fn new_stream_starts_with_its_share() {
        let mut cfg = QosConfig::builder();
        cfg.limit_global(900);
        let (lis, feed) = listener(&cfg.build().unwrap());
        connect(&feed, 1);
        connect(&feed, 2);
        connect(&feed, 3);
        let (a, _) = lis.accept().await.unwrap();
        assert_eq!(a.limit(), 900);
        let (b, _) = lis.accept().await.unwrap();
        let (c, _) = lis.accept().await.unwrap();
        // Before any update has been applied, the newest stream already has
        // the right share.
        assert_eq!(c.limit(), 300);
        settle().await;
        assert_eq!(a.limit(), 300);
        assert_eq!(b.limit(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn double_close_removes_once() {
        let (lis, feed) = listener(&QosConfig::default());
        connect(&feed, 1);
        connect(&feed, 2);
        let (mut a, _) = lis.accept().await.unwrap();
        let (_b, _) = lis.accept().await.unwrap();
        assert_eq!(lis.status().broadcasts, 2);

        a.close().await.unwrap();
        a.close().await.unwrap();
        drop(a);
        settle().await;
        let status = lis.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.broadcasts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_before_close_is_processed() {
        let mut cfg = QosConfig::builder();
        cfg.limit_global(1000);
        let (lis, feed) = listener(&cfg.build().unwrap());
        connect(&feed, 1);
        let (old, _) = lis.accept().await.unwrap();
        // The close notification is queued, but not yet handled...
        drop(old);
        connect(&feed, 1);
        // ...when the same client connects again.
        let (new, addr) = lis.accept().await.unwrap();
        assert_eq!(addr.port(), 1);
        assert_eq!(new.remote_addr().port(), 1);

        settle().await;
        let status = lis.status();
        assert_eq!(status.active, 1);
        assert_eq!(new.limit(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_burst_delay_is_harmless() {
        // Bypass validation, which would refuse this.
        let mut cfg = QosConfig::default();
        cfg.limit_per_conn = 1000;
        cfg.burst_delay = Duration::MAX;
        let (lis, feed) = listener(&cfg);
        connect(&feed, 1);
        let (s, _) = lis.accept().await.unwrap();
        assert_eq!(s.limit(), 1000);

        // The state is still usable.
        lis.set_limit_per_conn(500);
        settle().await;
        assert_eq!(s.limit(), 500);
        assert_eq!(lis.status().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_error_leaves_state_alone() {
        let (lis, feed) = listener(&QosConfig::default());
        feed.unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "nope")))
            .unwrap();
        let err = lis.accept().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(QosError::from_io(&err).is_none());
        let status = lis.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.broadcasts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_listener() {
        let (mut lis, feed) = listener(&QosConfig::default());
        connect(&feed, 1);
        let (s, _) = lis.accept().await.unwrap();
        lis.close();

        let err = lis.accept().await.err().unwrap();
        assert_matches!(QosError::from_io(&err), Some(QosError::ListenerClosed));
        assert!(lis.local_addr().is_err());
        assert!(Box::pin(lis.incoming()).next().await.is_none());

        // The close task is still running for the open stream...
        settle().await;
        assert_eq!(Arc::strong_count(&lis.state), 2);
        drop(s);
        settle().await;
        // ...and ends once it is gone.
        assert_eq!(lis.status().active, 0);
        assert_eq!(Arc::strong_count(&lis.state), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_task_ends_without_streams() {
        let (mut lis, _feed) = listener(&QosConfig::default());
        settle().await;
        assert_eq!(Arc::strong_count(&lis.state), 2);
        lis.close();
        settle().await;
        assert_eq!(Arc::strong_count(&lis.state), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn unknown_close_is_logged() {
        let (lis, _feed) = listener(&QosConfig::default());
        let bogus =
            QosState::new(0, 0, false).new_conn_id(SocketAddr::from(([10, 0, 0, 1], 4444)));
        lis.close_tx.as_ref().unwrap().unbounded_send(bogus).unwrap();
        settle().await;
        assert!(logs_contain("don't know about"));
        assert_eq!(lis.status().broadcasts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logging_applies_to_new_streams() {
        let (lis, feed) = listener(&QosConfig::default());
        connect(&feed, 1);
        let (a, _) = lis.accept().await.unwrap();
        assert!(!a.inner().is_logged());

        lis.enable_throughput_logging();
        connect(&feed, 2);
        let (b, _) = lis.accept().await.unwrap();
        assert!(b.inner().is_logged());
        assert_eq!(b.peer_addr().unwrap().port(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_and_handle() {
        let (lis, feed) = listener(&QosConfig::default());
        let handle = lis.handle();
        connect(&feed, 1);
        connect(&feed, 2);
        let accepted: Vec<_> = lis.incoming().take(2).collect().await;
        assert_eq!(accepted.len(), 2);

        // The handle works from another task.
        tokio::spawn(async move { handle.set_limit_global(1000) })
            .await
            .unwrap();
        settle().await;
        for r in &accepted {
            let (s, _) = r.as_ref().unwrap();
            assert_eq!(s.limit(), 500);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_is_passthrough() {
        let rt = TokioRuntimeHandle::current().unwrap();
        let (lis, feed) = listener(&QosConfig::default());
        let output = connect(&feed, 1);
        let (mut s, _) = lis.accept().await.unwrap();
        let start = rt.now();
        s.write_all(&[9; 1 << 20]).await.unwrap();
        assert_eq!(rt.now(), start);
        assert_eq!(output.lock().unwrap().len(), 1 << 20);
    }
}
