//! Scripted transports and in-memory connections for exercising the
//! dial coordinator without real networking.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use futures::future::BoxFuture;
use libp2p_identity::{Keypair, PeerId, PublicKey};
use multiaddr::{Multiaddr, Protocol};

use crate::{
    conn::{BoxedConn, Connection},
    transport::Transport,
};

pub(crate) fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn peer_id() -> PeerId {
    Keypair::generate_ed25519().public().to_peer_id()
}

pub(crate) fn memaddr(n: u64) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Memory(n))
}

/// In-memory [`Connection`]. Closes itself on drop, like a real
/// transport connection.
#[derive(Debug)]
pub(crate) struct MemConn {
    local: PeerId,
    remote: PeerId,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    remote_key: Option<PublicKey>,
    closed: Arc<AtomicBool>,
}

impl MemConn {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
    ) -> Self {
        Self {
            local,
            remote,
            local_addr,
            remote_addr,
            remote_key: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_remote_key(mut self, key: PublicKey) -> Self {
        self.remote_key = Some(key);
        self
    }

    /// Handle observing whether the connection was closed (or dropped).
    pub fn closed_handle(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Connection for MemConn {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }

    fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote_key.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// What a [`ScriptedTransport`] does when asked to dial an address.
#[derive(Debug, Clone)]
pub(crate) enum DialScript {
    /// Produce a connection to the requested peer after the delay.
    Succeed { delay: Duration },
    /// Produce a connection reporting a different remote peer, as a
    /// misbehaving transport would.
    SucceedAs { delay: Duration, remote: PeerId },
    /// Fail with the reason after the delay.
    Fail { delay: Duration, reason: String },
    /// Never complete.
    Hang,
}

/// Transport driven by per-address scripts.
///
/// Records every dial start, the number of dial futures dropped before
/// reaching a result, and a high-water mark of concurrently active
/// dials.
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    local: PeerId,
    fd: AtomicBool,
    scripts: Mutex<HashMap<Multiaddr, DialScript>>,
    keys: Mutex<HashMap<PeerId, PublicKey>>,
    dials: Mutex<Vec<Multiaddr>>,
    conns: Arc<Mutex<Vec<(Multiaddr, Arc<AtomicBool>)>>>,
    cancelled: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(local: PeerId) -> Arc<Self> {
        Arc::new(Self {
            local,
            fd: AtomicBool::new(false),
            scripts: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            dials: Mutex::new(Vec::new()),
            conns: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_fd_consuming(&self, fd: bool) {
        self.fd.store(fd, Ordering::SeqCst);
    }

    pub fn script(&self, addr: Multiaddr, script: DialScript) {
        self.scripts.lock().unwrap().insert(addr, script);
    }

    pub fn succeed(&self, addr: Multiaddr, delay: Duration) {
        self.script(addr, DialScript::Succeed { delay });
    }

    pub fn fail(&self, addr: Multiaddr, delay: Duration, reason: &str) {
        self.script(
            addr,
            DialScript::Fail {
                delay,
                reason: reason.to_string(),
            },
        );
    }

    pub fn hang(&self, addr: Multiaddr) {
        self.script(addr, DialScript::Hang);
    }

    /// Attach a public key that connections to `peer` will carry.
    pub fn add_key(&self, peer: PeerId, key: PublicKey) {
        self.keys.lock().unwrap().insert(peer, key);
    }

    /// Addresses for which a dial was started, in start order.
    pub fn dials(&self) -> Vec<Multiaddr> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    /// Dial futures dropped before reaching a result.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Dials currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most dials ever in flight at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Closed-flags of every connection this transport produced, in
    /// creation order.
    pub fn conns(&self) -> Vec<(Multiaddr, Arc<AtomicBool>)> {
        self.conns.lock().unwrap().clone()
    }

    fn make_conn(&self, addr: &Multiaddr, remote: PeerId) -> BoxedConn {
        let mut conn = MemConn::new(self.local, remote, memaddr(0), addr.clone());
        if let Some(key) = self.keys.lock().unwrap().get(&remote) {
            conn = conn.with_remote_key(key.clone());
        }
        self.conns
            .lock()
            .unwrap()
            .push((addr.clone(), conn.closed_handle()));
        Box::new(conn)
    }
}

impl Transport for ScriptedTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.scripts.lock().unwrap().contains_key(addr)
    }

    fn dial(&self, addr: Multiaddr, peer: PeerId) -> BoxFuture<'static, anyhow::Result<BoxedConn>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| DialScript::Fail {
                delay: Duration::ZERO,
                reason: "unscripted address".to_string(),
            });
        self.dials.lock().unwrap().push(addr.clone());

        let conn = match &script {
            DialScript::Succeed { .. } => Some(self.make_conn(&addr, peer)),
            DialScript::SucceedAs { remote, .. } => Some(self.make_conn(&addr, *remote)),
            _ => None,
        };
        let mut guard = ActiveGuard::enter(
            self.active.clone(),
            self.max_active.clone(),
            self.cancelled.clone(),
        );
        Box::pin(async move {
            let result = match script {
                DialScript::Succeed { delay } | DialScript::SucceedAs { delay, .. } => {
                    tokio::time::sleep(delay).await;
                    Ok(conn.expect("scripted connection"))
                }
                DialScript::Fail { delay, reason } => {
                    tokio::time::sleep(delay).await;
                    Err(anyhow!("{reason}"))
                }
                DialScript::Hang => std::future::pending().await,
            };
            guard.complete();
            result
        })
    }

    fn consumes_fd(&self) -> bool {
        self.fd.load(Ordering::SeqCst)
    }
}

/// Tracks one in-flight scripted dial; dropping it without
/// [`ActiveGuard::complete`] counts as a cancelled dial.
#[derive(Debug)]
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    completed: bool,
}

impl ActiveGuard {
    fn enter(
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    ) -> Self {
        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now_active, Ordering::SeqCst);
        Self {
            active,
            cancelled,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}
