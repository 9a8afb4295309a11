//! The dial facade and the per-peer dial engine.
//!
//! ```text
//!  many callers of dial_peer()    single     races many addrs     result to callers
//!  --------------------------\    flight      use earliest          /--------------
//!  ---------------------------\              |----------\          /---------------
//!  ---------------------------->------------<------      >--------<----------------
//!  ---------------------------|              \----x                \---------------
//!  --------------------------|                \-----x               \--------------
//!                                             any may fail         first success wins
//! ```
//!
//! [`Swarm::dial_peer`] is the entry point. It short-circuits to an
//! existing connection, applies the backoff gate and the dial timeout,
//! and coalesces concurrent callers through [`DialSync`]. The leader of
//! a coalesced effort runs the engine: fetch candidate addresses,
//! filter them, race the survivors through the [`DialLimiter`], take
//! the first verified success and cancel the rest.

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, trace, Instrument};

use crate::{
    backoff::DialBackoff,
    config::Config,
    conn::{BoxedConn, ConnRegistry, ConnTable, Direction, SwarmConn},
    dial_sync::DialSync,
    error::DialError,
    filter::{filter_known_undialables, AddrFilter, AllowAll, BestDestSelector},
    limiter::{DialJob, DialLimiter, DialResult},
    peers::{MemPeerStore, PeerStore},
    transport::{Transport, TransportRegistry},
};

/// The outbound dial coordinator.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Swarm {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    local: PeerId,
    config: Config,
    #[debug(skip)]
    peers: Arc<dyn PeerStore>,
    transports: TransportRegistry,
    #[debug(skip)]
    conns: Arc<dyn ConnRegistry>,
    #[debug(skip)]
    addr_filter: Arc<dyn AddrFilter>,
    #[debug(skip)]
    best_dest: Option<BestDestSelector>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    limiter: DialLimiter,
    dial_sync: DialSync,
    backoff: DialBackoff,
}

impl Swarm {
    pub fn builder(local: PeerId) -> SwarmBuilder {
        SwarmBuilder::new(local)
    }

    /// The local peer id.
    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    /// The peer store consulted for candidate addresses.
    pub fn peers(&self) -> &Arc<dyn PeerStore> {
        &self.inner.peers
    }

    /// The connection registry. New connections from any source (e.g.
    /// the inbound listener) should be registered here so dials can
    /// reuse them.
    pub fn conns(&self) -> &Arc<dyn ConnRegistry> {
        &self.inner.conns
    }

    /// The dial backoff registry.
    pub fn backoff(&self) -> &DialBackoff {
        &self.inner.backoff
    }

    /// Replace the set of our own interface listen addresses, used to
    /// avoid dialing ourselves.
    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        *self.inner.listen_addrs.write().expect("poisoned") = addrs;
    }

    /// Establish a connection to `peer`, reusing an existing one when
    /// possible.
    ///
    /// Concurrent calls for the same peer share a single dial effort
    /// and all observe its outcome. The whole effort is bounded by
    /// [`Config::dial_timeout`]; dropping the returned future cancels
    /// this caller's interest without disturbing other callers.
    pub async fn dial_peer(&self, peer: PeerId) -> Result<SwarmConn, DialError> {
        debug!(local = %self.inner.local, %peer, "dialing peer");
        if peer == self.inner.local {
            return Err(DialError::DialToSelf);
        }
        // Check if we already have an open connection first.
        if let Some(conn) = self.inner.conns.best_conn_to_peer(&peer) {
            return Ok(conn);
        }
        if self.inner.backoff.is_backoff(&peer) {
            debug!(%peer, "rejecting dial, peer is backed off");
            return Err(DialError::Backoff);
        }

        let leader = self
            .clone()
            .do_dial(peer)
            .instrument(error_span!("dial", %peer));
        let dial = self.inner.dial_sync.dial_lock(peer, leader);
        match tokio::time::timeout(self.inner.config.dial_timeout, dial).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DialError::Timeout),
        }
    }

    /// The leader's work: one dial effort whose outcome is shared with
    /// every coalesced caller.
    async fn do_dial(self, peer: PeerId) -> Result<SwarmConn, DialError> {
        // By the time we hold the dial slot we may already *have* a
        // connection to the peer.
        if let Some(conn) = self.inner.conns.best_conn_to_peer(&peer) {
            return Ok(conn);
        }
        match self.dial_attempt(peer).await {
            Ok(conn) => {
                self.inner.backoff.clear(&peer);
                if let Some(key) = conn.remote_public_key() {
                    self.inner.peers.add_pubkey(peer, key);
                }
                Ok(conn)
            }
            Err(err) => {
                if let Some(conn) = self.inner.conns.best_conn_to_peer_fallback(&peer) {
                    // Some parallel path got us a connection while the
                    // dial was failing; use it and forget the error.
                    debug!(%peer, %err, "ignoring dial error, we have a connection");
                    return Ok(conn);
                }
                if !err.is_cancellation() {
                    self.inner.backoff.add_backoff(peer);
                }
                Err(err)
            }
        }
    }

    /// Fetch, filter and race the candidate addresses for `peer`.
    async fn dial_attempt(&self, peer: PeerId) -> Result<SwarmConn, DialError> {
        // Just to double check. Costs nothing.
        if peer == self.inner.local {
            return Err(DialError::DialToSelf);
        }
        if self.inner.peers.priv_key(&self.inner.local).is_none() {
            debug!("no local private key, connection will not be secured");
        }

        let addrs = self.inner.peers.addrs(&peer);
        if addrs.is_empty() {
            return Err(DialError::NoAddresses);
        }
        let listen_addrs = self.inner.listen_addrs.read().expect("poisoned").clone();
        let mut good_addrs = filter_known_undialables(
            &addrs,
            &listen_addrs,
            &self.inner.transports,
            self.inner.addr_filter.as_ref(),
        );
        if good_addrs.is_empty() {
            return Err(DialError::NoGoodAddresses);
        }
        if let Some(select) = &self.inner.best_dest {
            let best = select(&peer, &good_addrs);
            if !best.is_empty() {
                good_addrs = best;
            }
        }

        debug!(%peer, candidates = good_addrs.len(), "racing addresses");
        let conn = self.dial_addrs(peer, good_addrs).await?;
        let swarm_conn = self
            .inner
            .conns
            .add_connection(conn, Direction::Outbound)
            .map_err(DialError::failed)?;
        debug!(%peer, conn = swarm_conn.id(), "dial succeeded");
        Ok(swarm_conn)
    }

    /// Race the addresses through the limiter and return the first
    /// verified success.
    async fn dial_addrs(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<BoxedConn, DialError> {
        // One token for the whole race: the winner cancels it, and
        // leaving this function (or being dropped mid-flight) cancels
        // it too, so every submitted job observes cancellation.
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();

        let (tx, mut rx) = mpsc::channel(addrs.len());
        let mut pending = addrs.into_iter();
        let mut active: usize = 0;
        let mut last_err: Option<DialError> = None;

        let result = loop {
            // Prefer draining a ready result over submitting more work.
            if active > 0 {
                match rx.try_recv() {
                    Ok(resp) => {
                        active -= 1;
                        match self.handle_response(peer, resp, &mut last_err) {
                            Some(conn) => break Ok(conn),
                            None => continue,
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }
            if let Some(addr) = pending.next() {
                self.limited_dial(peer, addr, tx.clone(), cancel.clone());
                active += 1;
                continue;
            }
            if active == 0 {
                break Err(last_err.take().unwrap_or(DialError::NoAddresses));
            }
            let resp = rx
                .recv()
                .await
                .expect("result channel closed while we hold a sender");
            active -= 1;
            if let Some(conn) = self.handle_response(peer, resp, &mut last_err) {
                break Ok(conn);
            }
        };
        self.inner.limiter.clear_all_peer_dials(&peer);
        result
    }

    /// Digest one address result. Returns the connection if this result
    /// wins the race.
    fn handle_response(
        &self,
        peer: PeerId,
        resp: DialResult,
        last_err: &mut Option<DialError>,
    ) -> Option<BoxedConn> {
        match resp.result {
            Ok(conn) => {
                if conn.remote_peer() != peer {
                    // Trusting the transport only goes so far.
                    error!(
                        %peer,
                        addr = %resp.addr,
                        connected = %conn.remote_peer(),
                        "transport bug: dialed peer and connected peer differ"
                    );
                    let err = anyhow!(
                        "transport connected to {} instead of {peer}",
                        conn.remote_peer()
                    );
                    conn.close();
                    *last_err = Some(DialError::failed(err));
                    return None;
                }
                trace!(%peer, addr = %resp.addr, "address won the race");
                Some(conn)
            }
            Err(err) => {
                // Errors are normal here, lots of dials fail.
                debug!(%peer, addr = %resp.addr, %err, "dial attempt failed");
                *last_err = Some(DialError::failed(err));
                None
            }
        }
    }

    /// Submit one address to the limiter.
    fn limited_dial(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        tx: mpsc::Sender<DialResult>,
        cancel: CancellationToken,
    ) {
        trace!(%peer, %addr, "queueing dial attempt");
        let Some(transport) = self.inner.transports.transport_for(&addr) else {
            // The filter normally removes these; transports may have
            // changed since.
            let _ = tx.try_send(DialResult {
                addr,
                result: Err(DialError::NoTransport.into()),
            });
            return;
        };
        self.inner.limiter.add_dial_job(DialJob {
            peer,
            addr,
            transport,
            tx,
            cancel,
        });
    }
}

/// Builder for a [`Swarm`].
///
/// The peer store, connection registry and address filter default to
/// [`MemPeerStore`], [`ConnTable`] and [`AllowAll`].
pub struct SwarmBuilder {
    local: PeerId,
    config: Config,
    transports: TransportRegistry,
    peers: Option<Arc<dyn PeerStore>>,
    conns: Option<Arc<dyn ConnRegistry>>,
    addr_filter: Option<Arc<dyn AddrFilter>>,
    best_dest: Option<BestDestSelector>,
    listen_addrs: Vec<Multiaddr>,
}

impl SwarmBuilder {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            config: Config::default(),
            transports: TransportRegistry::new(),
            peers: None,
            conns: None,
            addr_filter: None,
            best_dest: None,
            listen_addrs: Vec::new(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.register(transport);
        self
    }

    pub fn peer_store(mut self, peers: Arc<dyn PeerStore>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn conn_registry(mut self, conns: Arc<dyn ConnRegistry>) -> Self {
        self.conns = Some(conns);
        self
    }

    pub fn addr_filter(mut self, filter: Arc<dyn AddrFilter>) -> Self {
        self.addr_filter = Some(filter);
        self
    }

    /// Install a best-destination selector, applied to the candidate
    /// list after filtering.
    pub fn best_dest_selector(mut self, selector: BestDestSelector) -> Self {
        self.best_dest = Some(selector);
        self
    }

    /// Our own interface listen addresses, never dialed.
    pub fn listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    pub fn build(self) -> Swarm {
        let limiter = DialLimiter::new(self.config.fd_dial_limit, self.config.per_peer_dial_limit);
        let backoff = DialBackoff::new(self.config.backoff.clone());
        Swarm {
            inner: Arc::new(Inner {
                local: self.local,
                peers: self.peers.unwrap_or_else(|| Arc::new(MemPeerStore::new())),
                transports: self.transports,
                conns: self.conns.unwrap_or_else(|| Arc::new(ConnTable::new())),
                addr_filter: self.addr_filter.unwrap_or_else(|| Arc::new(AllowAll)),
                best_dest: self.best_dest,
                listen_addrs: RwLock::new(self.listen_addrs),
                limiter,
                dial_sync: DialSync::new(),
                backoff,
                config: self.config,
            }),
        }
    }
}
