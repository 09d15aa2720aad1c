//! The shared state of a [`QosListener`](crate::QosListener): the limits, and
//! the set of connections that they are divided between.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error, trace};

/// Compute the rate that each connection may use.
///
/// `limit_per_conn` and `limit_global` are in bytes per second, with zero
/// meaning "no limit"; `n_active` is the number of connections that share
/// the global limit.  Returns zero if neither limit applies.
pub(crate) fn actual_limit_per_conn(limit_per_conn: u64, limit_global: u64, n_active: usize) -> u64 {
    if limit_global == 0 || n_active == 0 {
        return limit_per_conn;
    }
    // Never round a real global limit down to zero, which would mean
    // "unlimited".
    let share = (limit_global / n_active as u64).max(1);
    if limit_per_conn == 0 {
        share
    } else {
        share.min(limit_per_conn)
    }
}

/// Identifies one accepted connection.
///
/// A client that reconnects from the same remote address gets a new
/// `ConnId`, even if we have not yet processed the close of its old one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ConnId {
    /// The remote address of the connection.
    addr: SocketAddr,
    /// The order in which the listener accepted it.
    serial: u64,
}

impl ConnId {
    /// Return the remote address of this connection.
    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.addr, self.serial)
    }
}

/// A snapshot of a listener's state, as returned by
/// [`QosHandle::status`](crate::QosHandle::status).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct QosStatus {
    /// The number of connections that are currently open.
    pub active: usize,
    /// The configured per-connection limit, in bytes per second.
    pub limit_per_conn: u64,
    /// The configured global limit, in bytes per second.
    pub limit_global: u64,
    /// The rate that each connection is currently being told to use.
    pub actual_limit_per_conn: u64,
    /// How many times the listener has pushed a new limit to its
    /// connections.
    pub broadcasts: u64,
}

/// The mutable state of a listener.
///
/// All changes happen with the lock held; every change that can affect the
/// per-connection allowance recomputes it and sends it to every active
/// connection before the lock is released.
#[derive(Debug)]
pub(crate) struct QosState {
    /// Per-connection limit in bytes per second; zero for none.
    limit_per_conn: u64,
    /// Global limit in bytes per second; zero for none.
    limit_global: u64,
    /// Whether newly accepted connections should log their throughput.
    log_throughput: bool,
    /// Every open connection, with the channel we use to tell it about new
    /// limits.
    active: HashMap<ConnId, watch::Sender<u64>>,
    /// The serial number for the next [`ConnId`].
    next_serial: u64,
    /// How many times we have called `broadcast`.
    broadcasts: u64,
}

/// A handle to a listener's shared state.
pub(crate) type SharedState = Arc<Mutex<QosState>>;

impl QosState {
    /// Create a new state with no connections.
    pub(crate) fn new(limit_per_conn: u64, limit_global: u64, log_throughput: bool) -> Self {
        QosState {
            limit_per_conn,
            limit_global,
            log_throughput,
            active: HashMap::new(),
            next_serial: 0,
            broadcasts: 0,
        }
    }

    /// Return the allowance that each active connection should currently
    /// have.
    pub(crate) fn actual_limit_per_conn(&self) -> u64 {
        actual_limit_per_conn(self.limit_per_conn, self.limit_global, self.active.len())
    }

    /// Return the allowance that each connection would have if one more
    /// were active.
    pub(crate) fn limit_for_new_conn(&self) -> u64 {
        actual_limit_per_conn(self.limit_per_conn, self.limit_global, self.active.len() + 1)
    }

    /// Return true if new connections should log their throughput.
    pub(crate) fn log_throughput(&self) -> bool {
        self.log_throughput
    }

    /// Allocate an identity for a new connection from `addr`.
    pub(crate) fn new_conn_id(&mut self, addr: SocketAddr) -> ConnId {
        let serial = self.next_serial;
        self.next_serial += 1;
        ConnId { addr, serial }
    }

    /// Recompute the per-connection allowance, and send it to every active
    /// connection.
    ///
    /// Never blocks: each connection only ever sees the latest value.
    fn broadcast(&mut self) {
        let limit = self.actual_limit_per_conn();
        for (conn, tx) in &self.active {
            trace!(%conn, limit, "sending new limit");
            tx.send_replace(limit);
        }
        self.broadcasts += 1;
    }

    /// Register the newly accepted connection `conn`, and rebalance.
    pub(crate) fn insert(&mut self, conn: ConnId, updates: watch::Sender<u64>) {
        self.active.insert(conn, updates);
        debug!(%conn, active = self.active.len(), "connection opened");
        self.broadcast();
    }

    /// Forget about the connection `conn`, and rebalance.
    ///
    /// Dropping its sender ends the connection's update task.
    pub(crate) fn remove(&mut self, conn: &ConnId) {
        if self.active.remove(conn).is_none() {
            error!(%conn, "Got a close notification for a connection we don't know about");
            return;
        }
        debug!(%conn, active = self.active.len(), "connection closed");
        self.broadcast();
    }

    /// Change the per-connection limit, and rebalance.
    pub(crate) fn set_limit_per_conn(&mut self, limit: u64) {
        debug!(limit, "setting per-connection limit");
        self.limit_per_conn = limit;
        self.broadcast();
    }

    /// Change the global limit, and rebalance.
    pub(crate) fn set_limit_global(&mut self, limit: u64) {
        debug!(limit, "setting global limit");
        self.limit_global = limit;
        self.broadcast();
    }

    /// Make future connections log their throughput.
    pub(crate) fn enable_throughput_logging(&mut self) {
        self.log_throughput = true;
    }

    /// Describe the current state.
    pub(crate) fn status(&self) -> QosStatus {
        QosStatus {
            active: self.active.len(),
            limit_per_conn: self.limit_per_conn,
            limit_global: self.limit_global,
            actual_limit_per_conn: self.actual_limit_per_conn(),
            broadcasts: self.broadcasts,
        }
    }
}
