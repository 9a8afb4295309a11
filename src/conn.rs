//! Connection contracts and the wrapper handed out to callers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use libp2p_identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;

/// Whether we accepted the connection or initiated it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    /// The remote peer connected to us.
    Inbound,
    /// We connected to the remote peer.
    Outbound,
}

/// A post-handshake, multiplexed connection as produced by a
/// [`Transport`].
///
/// Implementations must also close the connection when the value is
/// dropped: a dial that loses the address race may never get the chance
/// to call [`Connection::close`] explicitly.
///
/// [`Transport`]: crate::Transport
pub trait Connection: fmt::Debug + Send + Sync + 'static {
    /// The local peer of the connection.
    fn local_peer(&self) -> PeerId;
    /// The remote peer the transport authenticated.
    fn remote_peer(&self) -> PeerId;
    /// The local address of the connection.
    fn local_addr(&self) -> Multiaddr;
    /// The remote address of the connection.
    fn remote_addr(&self) -> Multiaddr;
    /// The remote's public key, if the secure channel surfaced one.
    fn remote_public_key(&self) -> Option<PublicKey>;
    /// Close the connection.
    fn close(&self);
}

/// A [`Connection`] as it travels through the dial pipeline.
pub type BoxedConn = Box<dyn Connection>;

/// Cheap-to-clone handle to a registered connection.
///
/// All clones refer to the same underlying connection; [`SwarmConn::id`]
/// identifies it.
#[derive(Debug, Clone)]
pub struct SwarmConn {
    inner: Arc<ConnInner>,
}

#[derive(Debug)]
struct ConnInner {
    id: u64,
    direction: Direction,
    conn: BoxedConn,
}

impl SwarmConn {
    pub(crate) fn new(id: u64, conn: BoxedConn, direction: Direction) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id,
                direction,
                conn,
            }),
        }
    }

    /// Registry-assigned identifier, stable across clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the connection was accepted or initiated.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.conn.local_peer()
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.conn.remote_peer()
    }

    pub fn local_addr(&self) -> Multiaddr {
        self.inner.conn.local_addr()
    }

    pub fn remote_addr(&self) -> Multiaddr {
        self.inner.conn.remote_addr()
    }

    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.inner.conn.remote_public_key()
    }

    /// Close the underlying connection for all clones.
    pub fn close(&self) {
        self.inner.conn.close()
    }
}

/// Where established connections live.
///
/// The dial coordinator registers every verified outbound connection
/// here and consults the registry to reuse connections that appeared
/// from any source, including the inbound listener.
pub trait ConnRegistry: Send + Sync + 'static {
    /// Register a connection and return the wrapper handed to callers.
    ///
    /// On error the registry takes responsibility for closing the
    /// connection.
    fn add_connection(&self, conn: BoxedConn, direction: Direction) -> anyhow::Result<SwarmConn>;

    /// The preferred usable connection to `peer`, if any.
    fn best_conn_to_peer(&self, peer: &PeerId) -> Option<SwarmConn>;

    /// Like [`ConnRegistry::best_conn_to_peer`], consulted only after a
    /// dial error to find a connection some parallel path produced
    /// meanwhile.
    fn best_conn_to_peer_fallback(&self, peer: &PeerId) -> Option<SwarmConn>;
}

/// Default in-memory registry grouping connections by remote peer.
#[derive(Debug, Default)]
pub struct ConnTable {
    next_id: AtomicU64,
    conns: Mutex<HashMap<PeerId, Vec<SwarmConn>>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all connections to `peer`, returning how many were removed.
    pub fn remove_peer(&self, peer: &PeerId) -> usize {
        let mut conns = self.conns.lock().expect("poisoned");
        conns.remove(peer).map(|v| v.len()).unwrap_or(0)
    }

    /// Number of registered connections to `peer`.
    pub fn conn_count(&self, peer: &PeerId) -> usize {
        let conns = self.conns.lock().expect("poisoned");
        conns.get(peer).map(|v| v.len()).unwrap_or(0)
    }
}

impl ConnRegistry for ConnTable {
    fn add_connection(&self, conn: BoxedConn, direction: Direction) -> anyhow::Result<SwarmConn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wrapped = SwarmConn::new(id, conn, direction);
        let mut conns = self.conns.lock().expect("poisoned");
        conns
            .entry(wrapped.remote_peer())
            .or_default()
            .push(wrapped.clone());
        Ok(wrapped)
    }

    fn best_conn_to_peer(&self, peer: &PeerId) -> Option<SwarmConn> {
        let conns = self.conns.lock().expect("poisoned");
        conns.get(peer).and_then(|v| v.first()).cloned()
    }

    fn best_conn_to_peer_fallback(&self, peer: &PeerId) -> Option<SwarmConn> {
        self.best_conn_to_peer(peer)
    }
}
