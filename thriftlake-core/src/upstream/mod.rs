//! Upstream abstractions: routes, clusters, and pooled connections.
//!
//! A routing filter resolves a message to a cluster through [`Route`] and
//! [`ClusterManager`], checks a connection out of the cluster's [`ConnPool`],
//! and, between `pool_ready` and release, exclusively owns the connection's
//! read side through [`UpstreamCallbacks`]. The pool serializes
//! all callbacks onto the worker's event loop; none of these traits are
//! thread safe by design.
use std::rc::Rc;

use bytes::BytesMut;

use crate::thrift::{ProtocolType, ThriftConnectionState, TransportType};

/// Resolution of one message to a target cluster.
pub trait RouteEntry {
    fn cluster_name(&self) -> &str;
}

/// A matched route. `route_entry` is absent when the route table matched
/// nothing.
pub trait Route {
    fn route_entry(&self) -> Option<&dyn RouteEntry>;
}

/// A known upstream cluster.
pub trait Cluster {
    fn name(&self) -> &str;

    /// A cluster in maintenance mode accepts no new requests.
    fn maintenance_mode(&self) -> bool;

    /// Transport flavor to speak to this cluster, when configured. Absent
    /// means inherit the downstream's.
    fn transport_override(&self) -> Option<TransportType> {
        None
    }

    /// Protocol flavor to speak to this cluster, when configured. Absent
    /// means inherit the downstream's.
    fn protocol_override(&self) -> Option<ProtocolType> {
        None
    }
}

/// Cluster lookup and per-cluster pool access.
pub trait ClusterManager {
    fn cluster(&self, name: &str) -> Option<Rc<dyn Cluster>>;

    /// The cluster's connection pool, or `None` when no healthy host is
    /// available.
    fn conn_pool_for_cluster(&self, name: &str) -> Option<Rc<dyn ConnPool>>;
}

/// Why a pool checkout failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// The pool is at its connection bound.
    Overflow,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    Timeout,
}

/// Connection lifecycle events delivered to the read-side owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    RemoteClose,
    LocalClose,
}

/// How to dispose of buffered write data when closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Close immediately, discarding anything not yet written.
    NoFlush,
    /// Flush pending writes, then close.
    FlushWrite,
}

/// Write side of an established connection.
pub trait Connection {
    /// Queues `data` for transmission. `end_stream` half-closes the write
    /// side after the data is flushed.
    fn write(&self, data: BytesMut, end_stream: bool);

    fn close(&self, close_type: CloseType);
}

/// Read-side owner of a checked-out upstream connection.
pub trait UpstreamCallbacks {
    /// Bytes arrived from upstream. `end_stream` is set when the remote
    /// half-closed and no further bytes will arrive.
    fn on_upstream_data(&self, buffer: &mut BytesMut, end_stream: bool);

    fn on_event(&self, event: ConnectionEvent);
}

/// A checked-out pooled connection.
///
/// Held by exactly one tenant between `pool_ready` and check-in. Dropping it
/// without going through [`ConnPool::released`] discards the connection
/// instead of recycling it.
pub trait ConnectionData {
    fn connection(&self) -> Rc<dyn Connection>;

    /// Installs the tenant as the connection's read-side owner.
    fn set_upstream_callbacks(&self, callbacks: Rc<dyn UpstreamCallbacks>);

    /// Sticky protocol state attached to this connection, if any tenant
    /// created one before.
    fn connection_state(&self) -> Option<Rc<ThriftConnectionState>>;

    /// Attaches sticky protocol state to this connection. The state outlives
    /// the checkout and is visible to subsequent tenants.
    fn set_connection_state(&self, state: Rc<ThriftConnectionState>);

    /// Hints whether the connection may be recycled at check-in.
    fn set_reuse(&self, reuse: bool);
}

/// Cancels a pending pool checkout.
pub trait CancelHandle {
    fn cancel(&self);
}

/// Checkout readiness callbacks.
///
/// `pool_ready` takes the receiver by `Rc` so the tenant can install itself
/// as the connection's [`UpstreamCallbacks`] without a separate handle.
pub trait PoolCallbacks {
    fn pool_ready(self: Rc<Self>, conn: Box<dyn ConnectionData>);
    fn pool_failure(&self, reason: PoolFailureReason);
}

/// A per-cluster pool of upstream connections.
pub trait ConnPool {
    /// Requests a connection. May complete synchronously (callbacks invoked
    /// inline, returns `None`) or asynchronously (returns a cancel handle,
    /// callbacks fire later on the same thread).
    fn new_connection(&self, callbacks: Rc<dyn PoolCallbacks>) -> Option<Rc<dyn CancelHandle>>;

    /// Checks a connection back in for reuse.
    fn released(&self, conn: Box<dyn ConnectionData>);
}
