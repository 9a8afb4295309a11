//! Outbound dial coordination for a peer-to-peer networking stack.
//!
//! This crate turns "give me a connection to peer `P`" into at most one
//! established, authenticated connection to `P`:
//!
//! - concurrent callers for the same peer are coalesced onto a single
//!   dial effort and all observe its outcome,
//! - every known address of the peer is raced through a concurrency
//!   limiter (a global cap for fd-consuming transports, a per-peer cap
//!   for everything); the first success wins and the losers are
//!   cancelled and cleaned up,
//! - peers that keep failing are suppressed with a quadratic backoff
//!   until they succeed again,
//! - a connection appearing from any other source (e.g. the inbound
//!   listener) while a dial is underway is reused instead.
//!
//! Entry point is [`Swarm::dial_peer`]. Transports, the peer store, the
//! connection registry and the address-blocking policy are external
//! collaborators plugged in through the [`Transport`], [`PeerStore`],
//! [`ConnRegistry`] and [`AddrFilter`] traits via [`SwarmBuilder`];
//! in-memory defaults ([`MemPeerStore`], [`ConnTable`]) are provided.

pub mod backoff;
pub mod config;
pub mod conn;
pub mod error;
pub mod filter;
pub mod peers;
pub mod swarm;
pub mod transport;

mod dial_sync;
mod limiter;
#[cfg(test)]
mod test_utils;

pub use self::{
    backoff::DialBackoff,
    config::{BackoffConfig, Config},
    conn::{BoxedConn, ConnRegistry, ConnTable, Connection, Direction, SwarmConn},
    error::DialError,
    filter::{AddrFilter, AllowAll, BestDestSelector},
    peers::{MemPeerStore, PeerStore},
    swarm::{Swarm, SwarmBuilder},
    transport::{Transport, TransportRegistry},
};

// The identity and addressing types used throughout the API.
pub use libp2p_identity::{Keypair, PeerId, PublicKey};
pub use multiaddr::Multiaddr;
