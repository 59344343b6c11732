//! Monoio-backed upstream connection pool.
//!
//! Implements the core pool seams ([`ConnPool`], [`ConnectionData`],
//! [`Connection`]) over `monoio` TCP sockets. Each established connection is
//! split into a reader and a writer task: the reader forwards bytes and
//! close events to whichever tenant currently owns the connection's read
//! side, and the writer drains a command channel so the router's
//! fire-and-forget `write` never blocks a callback.
//!
//! Checkout prefers an idle connection (synchronous readiness, no cancel
//! handle); otherwise a connect task is spawned and the caller gets a cancel
//! handle. The pool is bounded: checkouts beyond `max_connections` fail
//! synchronously with [`PoolFailureReason::Overflow`].
//!
//! Sticky per-connection protocol state (the upgrade memo) lives on the pool
//! member, so it survives check-in and is visible to the next tenant of the
//! same socket.
//!
//! Everything here is per worker thread: `Rc` handles, no locks, callbacks
//! delivered on the same event loop that runs the router.
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    rc::{Rc, Weak},
    time::Duration,
};

use anyhow::bail;
use bytes::BytesMut;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::StreamExt;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Splitable};
use monoio_transports::connectors::{Connector, TcpConnector};
use serde::{Deserialize, Serialize};
use thriftlake_core::{
    thrift::{ProtocolType, ThriftConnectionState, TransportType},
    upstream::{
        CancelHandle, CloseType, Cluster, ClusterManager, ConnPool, Connection, ConnectionData,
        ConnectionEvent, PoolCallbacks, PoolFailureReason, UpstreamCallbacks,
    },
    AnyResult,
};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

const fn default_max_connections() -> usize {
    1024
}

/// Configuration of one upstream cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// Upstream endpoint. One host per cluster; balancing across hosts is a
    /// cluster-manager concern, not a pool concern.
    pub endpoint: SocketAddr,

    /// Transport flavor to speak upstream. Absent means inherit the
    /// downstream's.
    #[serde(default)]
    pub transport: Option<TransportType>,

    /// Protocol flavor to speak upstream. Absent means inherit the
    /// downstream's.
    #[serde(default)]
    pub protocol: Option<ProtocolType>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub connect_timeout: Option<Duration>,

    /// A cluster in maintenance mode accepts no new requests.
    #[serde(default)]
    pub maintenance: bool,
}

/// Fixed cluster set backing the router's [`ClusterManager`] seam.
pub struct StaticClusterManager {
    clusters: HashMap<String, Rc<StaticCluster>>,
}

impl StaticClusterManager {
    pub fn from_configs<I>(configs: I) -> AnyResult<Self>
    where
        I: IntoIterator<Item = ClusterConfig>,
    {
        let mut clusters = HashMap::new();
        for config in configs {
            if config.name.is_empty() {
                bail!("cluster with empty name");
            }
            let name = config.name.clone();
            let pool = TcpPool::new(config.endpoint, config.max_connections, config.connect_timeout);
            if clusters
                .insert(name.clone(), Rc::new(StaticCluster { config, pool }))
                .is_some()
            {
                bail!("duplicate cluster '{name}'");
            }
        }
        Ok(StaticClusterManager { clusters })
    }
}

impl ClusterManager for StaticClusterManager {
    fn cluster(&self, name: &str) -> Option<Rc<dyn Cluster>> {
        self.clusters.get(name).map(|c| c.clone() as Rc<dyn Cluster>)
    }

    fn conn_pool_for_cluster(&self, name: &str) -> Option<Rc<dyn ConnPool>> {
        self.clusters
            .get(name)
            .map(|c| c.pool.clone() as Rc<dyn ConnPool>)
    }
}

struct StaticCluster {
    config: ClusterConfig,
    pool: Rc<TcpPool>,
}

impl Cluster for StaticCluster {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn maintenance_mode(&self) -> bool {
        self.config.maintenance
    }

    fn transport_override(&self) -> Option<TransportType> {
        self.config.transport
    }

    fn protocol_override(&self) -> Option<ProtocolType> {
        self.config.protocol
    }
}

/// Bounded pool of TCP connections to a single upstream endpoint.
pub struct TcpPool {
    endpoint: SocketAddr,
    connector: TcpConnector,
    max_connections: usize,
    connect_timeout: Option<Duration>,

    active: Cell<usize>,
    next_id: Cell<u64>,
    idle: RefCell<VecDeque<Rc<PoolMember>>>,
    weak: Weak<TcpPool>,
}

impl TcpPool {
    pub fn new(
        endpoint: SocketAddr,
        max_connections: usize,
        connect_timeout: Option<Duration>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| TcpPool {
            endpoint,
            connector: TcpConnector::default(),
            max_connections,
            connect_timeout,
            active: Cell::new(0),
            next_id: Cell::new(0),
            idle: RefCell::new(VecDeque::new()),
            weak: weak.clone(),
        })
    }

    fn shared(&self) -> Rc<TcpPool> {
        self.weak.upgrade().expect("pool handle outlived the pool")
    }

    /// Takes a connection out of service. Idempotent; the first call does
    /// the bookkeeping.
    fn retire(&self, member: &Rc<PoolMember>) -> bool {
        if member.dead.replace(true) {
            return false;
        }
        let _ = member.writer.unbounded_send(WriteCommand::Close);
        self.idle.borrow_mut().retain(|m| m.id != member.id);
        self.active.set(self.active.get().saturating_sub(1));
        trace!(id = member.id, active = self.active.get(), "retired upstream connection");
        true
    }

    fn check_in(&self, member: Rc<PoolMember>) {
        trace!(id = member.id, "upstream connection back in pool");
        self.idle.borrow_mut().push_back(member);
    }

    fn install(&self, stream: monoio::net::TcpStream) -> Rc<PoolMember> {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (read_half, write_half) = stream.into_split();
        let (writer, rx) = unbounded();
        let member = Rc::new(PoolMember {
            id,
            writer,
            callbacks: RefCell::new(None),
            state: RefCell::new(None),
            dead: Cell::new(false),
            discard_writes: Cell::new(false),
        });
        monoio::spawn(write_loop(self.shared(), member.clone(), write_half, rx));
        monoio::spawn(read_loop(self.shared(), member.clone(), read_half));
        member
    }

    fn checkout(&self, member: Rc<PoolMember>) -> Box<dyn ConnectionData> {
        let link = Rc::new(PooledConnection {
            pool: self.shared(),
            member: member.clone(),
        });
        Box::new(PooledConnectionData {
            pool: self.shared(),
            member,
            link,
            reuse: Cell::new(false),
        })
    }
}

impl ConnPool for TcpPool {
    fn new_connection(&self, callbacks: Rc<dyn PoolCallbacks>) -> Option<Rc<dyn CancelHandle>> {
        // Prefer a live idle connection: synchronous readiness, no handle.
        loop {
            let member = self.idle.borrow_mut().pop_front();
            match member {
                Some(member) if member.dead.get() => continue,
                Some(member) => {
                    trace!(id = member.id, "reusing idle upstream connection");
                    let conn = self.checkout(member);
                    callbacks.pool_ready(conn);
                    return None;
                }
                None => break,
            }
        }

        if self.active.get() >= self.max_connections {
            debug!(
                endpoint = %self.endpoint,
                bound = self.max_connections,
                "connection pool overflow"
            );
            callbacks.pool_failure(PoolFailureReason::Overflow);
            return None;
        }
        self.active.set(self.active.get() + 1);

        let cancelled = Rc::new(Cell::new(false));
        let flag = cancelled.clone();
        let pool = self.shared();
        monoio::spawn(async move {
            let connect = pool.connector.connect(pool.endpoint);
            let result = match pool.connect_timeout {
                Some(timeout) => match monoio::time::timeout(timeout, connect).await {
                    Ok(inner) => inner.map_err(|e| {
                        warn!(endpoint = %pool.endpoint, error = ?e, "upstream connect failed");
                        PoolFailureReason::RemoteConnectionFailure
                    }),
                    Err(_) => Err(PoolFailureReason::Timeout),
                },
                None => connect.await.map_err(|e| {
                    warn!(endpoint = %pool.endpoint, error = ?e, "upstream connect failed");
                    PoolFailureReason::RemoteConnectionFailure
                }),
            };
            match result {
                Ok(stream) => {
                    if flag.get() {
                        // Checkout was cancelled while connecting; the
                        // socket was never handed out, just drop it.
                        pool.active.set(pool.active.get().saturating_sub(1));
                        return;
                    }
                    let member = pool.install(stream);
                    let conn = pool.checkout(member);
                    callbacks.pool_ready(conn);
                }
                Err(reason) => {
                    pool.active.set(pool.active.get().saturating_sub(1));
                    if flag.get() {
                        return;
                    }
                    callbacks.pool_failure(reason);
                }
            }
        });
        Some(Rc::new(ConnectCancelHandle { cancelled }))
    }

    fn released(&self, conn: Box<dyn ConnectionData>) {
        // Recycling happens when the data handle drops with the reuse hint
        // set; a handle dropped without it discards the connection.
        conn.set_reuse(true);
    }
}

/// One established upstream connection, shared between its reader/writer
/// tasks, the pool's idle list, and the current tenant.
struct PoolMember {
    id: u64,
    writer: UnboundedSender<WriteCommand>,
    callbacks: RefCell<Option<Rc<dyn UpstreamCallbacks>>>,
    state: RefCell<Option<Rc<ThriftConnectionState>>>,
    dead: Cell<bool>,
    discard_writes: Cell<bool>,
}

enum WriteCommand {
    Data(BytesMut),
    Close,
}

struct ConnectCancelHandle {
    cancelled: Rc<Cell<bool>>,
}

impl CancelHandle for ConnectCancelHandle {
    fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// Write-side handle given to the tenant.
struct PooledConnection {
    pool: Rc<TcpPool>,
    member: Rc<PoolMember>,
}

impl Connection for PooledConnection {
    fn write(&self, data: BytesMut, end_stream: bool) {
        if self.member.dead.get() {
            return;
        }
        let _ = self.member.writer.unbounded_send(WriteCommand::Data(data));
        if end_stream {
            let _ = self.member.writer.unbounded_send(WriteCommand::Close);
        }
    }

    fn close(&self, close_type: CloseType) {
        if let CloseType::NoFlush = close_type {
            self.member.discard_writes.set(true);
        }
        self.pool.retire(&self.member);
    }
}

/// The checked-out connection handle.
struct PooledConnectionData {
    pool: Rc<TcpPool>,
    member: Rc<PoolMember>,
    link: Rc<PooledConnection>,
    reuse: Cell<bool>,
}

impl ConnectionData for PooledConnectionData {
    fn connection(&self) -> Rc<dyn Connection> {
        self.link.clone()
    }

    fn set_upstream_callbacks(&self, callbacks: Rc<dyn UpstreamCallbacks>) {
        *self.member.callbacks.borrow_mut() = Some(callbacks);
    }

    fn connection_state(&self) -> Option<Rc<ThriftConnectionState>> {
        self.member.state.borrow().clone()
    }

    fn set_connection_state(&self, state: Rc<ThriftConnectionState>) {
        *self.member.state.borrow_mut() = Some(state);
    }

    fn set_reuse(&self, reuse: bool) {
        self.reuse.set(reuse);
    }
}

impl Drop for PooledConnectionData {
    fn drop(&mut self) {
        self.member.callbacks.borrow_mut().take();
        if self.reuse.get() && !self.member.dead.get() {
            self.pool.check_in(self.member.clone());
        } else {
            self.pool.retire(&self.member);
        }
    }
}

async fn write_loop<W: AsyncWriteRent>(
    pool: Rc<TcpPool>,
    member: Rc<PoolMember>,
    mut io: W,
    mut rx: UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = rx.next().await {
        match command {
            WriteCommand::Data(data) => {
                if member.discard_writes.get() {
                    continue;
                }
                let (result, _) = io.write_all(data).await;
                if let Err(e) = result {
                    warn!(id = member.id, error = ?e, "upstream write failed");
                    let callbacks = member.callbacks.borrow().clone();
                    if pool.retire(&member) {
                        if let Some(callbacks) = callbacks {
                            callbacks.on_event(ConnectionEvent::LocalClose);
                        }
                    }
                    break;
                }
            }
            WriteCommand::Close => break,
        }
    }
    let _ = io.shutdown().await;
}

async fn read_loop<R: AsyncReadRent>(pool: Rc<TcpPool>, member: Rc<PoolMember>, mut io: R) {
    loop {
        let (result, buf) = io.read(Vec::with_capacity(READ_BUFFER_SIZE)).await;
        match result {
            Ok(0) => {
                let callbacks = member.callbacks.borrow().clone();
                if pool.retire(&member) {
                    if let Some(callbacks) = callbacks {
                        callbacks.on_event(ConnectionEvent::RemoteClose);
                    }
                }
                return;
            }
            Ok(_) => {
                let callbacks = member.callbacks.borrow().clone();
                match callbacks {
                    Some(callbacks) => {
                        let mut bytes = BytesMut::from(&buf[..]);
                        callbacks.on_upstream_data(&mut bytes, false);
                    }
                    None => {
                        // A pooled connection has no business talking while
                        // idle; treat it as broken.
                        warn!(id = member.id, "unsolicited data on idle upstream connection");
                        member.discard_writes.set(true);
                        pool.retire(&member);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(id = member.id, error = ?e, "upstream read failed");
                let callbacks = member.callbacks.borrow().clone();
                if pool.retire(&member) {
                    if let Some(callbacks) = callbacks {
                        callbacks.on_event(ConnectionEvent::RemoteClose);
                    }
                }
                return;
            }
        }
        if member.dead.get() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct RecordingCallbacks {
        ready: Cell<usize>,
        failures: RefCell<Vec<PoolFailureReason>>,
    }

    impl PoolCallbacks for RecordingCallbacks {
        fn pool_ready(self: Rc<Self>, _conn: Box<dyn ConnectionData>) {
            self.ready.set(self.ready.get() + 1);
        }

        fn pool_failure(&self, reason: PoolFailureReason) {
            self.failures.borrow_mut().push(reason);
        }
    }

    fn config(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            endpoint: "127.0.0.1:9090".parse().unwrap(),
            transport: None,
            protocol: None,
            max_connections: default_max_connections(),
            connect_timeout: None,
            maintenance: false,
        }
    }

    #[test]
    fn overflow_fails_synchronously() {
        let pool = TcpPool::new("127.0.0.1:9090".parse().unwrap(), 0, None);
        let callbacks = Rc::new(RecordingCallbacks::default());
        let handle = pool.new_connection(callbacks.clone());
        assert!(handle.is_none());
        assert_eq!(callbacks.ready.get(), 0);
        assert_eq!(
            *callbacks.failures.borrow(),
            vec![PoolFailureReason::Overflow]
        );
    }

    #[test]
    fn duplicate_cluster_is_rejected() {
        let result = StaticClusterManager::from_configs([config("a"), config("a")]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_cluster_resolves_to_none() {
        let manager = StaticClusterManager::from_configs([config("a")]).unwrap();
        assert!(manager.cluster("a").is_some());
        assert!(manager.conn_pool_for_cluster("a").is_some());
        assert!(manager.cluster("b").is_none());
        assert!(manager.conn_pool_for_cluster("b").is_none());
    }

    #[test]
    fn cluster_exposes_configured_overrides() {
        let mut cfg = config("a");
        cfg.transport = Some(TransportType::Framed);
        cfg.protocol = Some(ProtocolType::Binary);
        cfg.maintenance = true;
        let manager = StaticClusterManager::from_configs([cfg]).unwrap();
        let cluster = manager.cluster("a").unwrap();
        assert_eq!(cluster.transport_override(), Some(TransportType::Framed));
        assert_eq!(cluster.protocol_override(), Some(ProtocolType::Binary));
        assert!(cluster.maintenance_mode());
    }
}
