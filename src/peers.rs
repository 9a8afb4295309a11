//! The peer store contract consumed by the dialer, and a simple
//! in-memory implementation.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use libp2p_identity::{Keypair, PeerId, PublicKey};
use multiaddr::Multiaddr;

/// Address book and key store, read by the dial coordinator.
///
/// Implementations must be internally thread-safe.
pub trait PeerStore: Send + Sync + 'static {
    /// Known candidate addresses for `peer`, in preference order.
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;
    /// Record a public key learned for `peer`, e.g. from a secured
    /// connection.
    fn add_pubkey(&self, peer: PeerId, key: PublicKey);
    /// The private key for `peer`, if we hold one. Consulted for the
    /// local peer when securing outbound connections.
    fn priv_key(&self, peer: &PeerId) -> Option<Keypair>;
}

/// In-memory [`PeerStore`].
#[derive(Debug, Default)]
pub struct MemPeerStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    addrs: HashMap<PeerId, Vec<Multiaddr>>,
    pubkeys: HashMap<PeerId, PublicKey>,
    keys: HashMap<PeerId, Keypair>,
}

impl MemPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append addresses for `peer`, skipping ones already known.
    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut inner = self.inner.lock().expect("poisoned");
        let known = inner.addrs.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }

    /// Store the private key for `peer`.
    pub fn set_priv_key(&self, peer: PeerId, key: Keypair) {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.keys.insert(peer, key);
    }

    /// The public key recorded for `peer`, if any.
    pub fn pubkey(&self, peer: &PeerId) -> Option<PublicKey> {
        let inner = self.inner.lock().expect("poisoned");
        inner.pubkeys.get(peer).cloned()
    }
}

impl PeerStore for MemPeerStore {
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let inner = self.inner.lock().expect("poisoned");
        inner.addrs.get(peer).cloned().unwrap_or_default()
    }

    fn add_pubkey(&self, peer: PeerId, key: PublicKey) {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.pubkeys.insert(peer, key);
    }

    fn priv_key(&self, peer: &PeerId) -> Option<Keypair> {
        let inner = self.inner.lock().expect("poisoned");
        inner.keys.get(peer).cloned()
    }
}
