//! Errors surfaced to callers of [`Swarm::dial_peer`].
//!
//! [`Swarm::dial_peer`]: crate::Swarm::dial_peer

use std::sync::Arc;

/// The error returned when establishing a connection to a peer fails.
///
/// Cloneable so that a single dial effort can broadcast its outcome to
/// every caller that was coalesced onto it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialError {
    /// The requested peer is the local peer.
    #[error("dial to self attempted")]
    DialToSelf,
    /// The peer is in dial backoff; failing fast instead of waiting.
    #[error("dial backoff")]
    Backoff,
    /// The peer store has no addresses for the peer.
    #[error("no addresses")]
    NoAddresses,
    /// Address filtering removed every candidate address.
    #[error("no good addresses")]
    NoGoodAddresses,
    /// No registered transport can dial the address.
    ///
    /// Reported per address, not per peer: other addresses of the same
    /// peer may still be dialable.
    #[error("no transport for protocol")]
    NoTransport,
    /// Every attempted address failed. Carries the last observed cause.
    #[error("dial attempt failed: {0}")]
    DialFailed(Arc<anyhow::Error>),
    /// The dial was cancelled before it completed.
    #[error("dial cancelled")]
    Cancelled,
    /// The dial did not complete within the configured dial timeout.
    #[error("dial timed out")]
    Timeout,
}

impl DialError {
    pub(crate) fn failed(cause: anyhow::Error) -> Self {
        Self::DialFailed(Arc::new(cause))
    }

    /// Whether this error reports cancellation or timeout rather than
    /// peer fault. Such errors are never recorded in the backoff
    /// registry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}
