//! The transport contract consumed by the dialer.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

use crate::conn::BoxedConn;

/// A module able to open one directed connection over a specific
/// protocol stack.
///
/// Transports are external to the dial coordinator; it only relies on
/// this contract.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Whether this transport knows how to dial `addr`.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Open a connection to `peer` at `addr`.
    ///
    /// The returned future is dropped when the dial is cancelled;
    /// implementations must release any partial state on drop. The
    /// connection handed back must report `peer` as its remote peer.
    fn dial(&self, addr: Multiaddr, peer: PeerId) -> BoxFuture<'static, anyhow::Result<BoxedConn>>;

    /// Whether each dial over this transport holds a scarce OS handle
    /// (socket). Such dials count against the global fd cap; others
    /// bypass it.
    fn consumes_fd(&self) -> bool;
}

/// The set of loaded transports, resolving addresses to the transport
/// that dials them.
#[derive(Debug, Clone, Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// The first registered transport that can dial `addr`, if any.
    pub fn transport_for(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.can_dial(addr)).cloned()
    }

    /// Whether any registered transport can dial `addr`.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.transport_for(addr).is_some()
    }
}
