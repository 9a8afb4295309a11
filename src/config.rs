//! Tunables for the dial coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of concurrent outbound dials over transports that
/// consume file descriptors.
pub const DEFAULT_FD_DIAL_LIMIT: usize = 160;
/// Maximum number of concurrent outbound dials to a single peer.
pub const DEFAULT_PER_PEER_DIAL_LIMIT: usize = 8;
/// Deadline for one whole `dial_peer` effort.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`Swarm`].
///
/// [`Swarm`]: crate::Swarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Cap on concurrent dials over fd-consuming transports, across all
    /// peers. Dials over transports that do not consume file descriptors
    /// (in-memory, multiplexed-over-existing) bypass this cap.
    pub fd_dial_limit: usize,
    /// Cap on concurrent dials to a single peer, over any transport.
    pub per_peer_dial_limit: usize,
    /// How long a caller of `dial_peer` waits for the whole effort,
    /// including time spent parked in the limiter.
    pub dial_timeout: Duration,
    /// Failure suppression curve.
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fd_dial_limit: DEFAULT_FD_DIAL_LIMIT,
            per_peer_dial_limit: DEFAULT_PER_PEER_DIAL_LIMIT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Parameters of the quadratic dial backoff.
///
/// After `tries` prior failures the suppression window is
/// `base + coef * tries^2`, capped at `max`. Quadratic rather than
/// exponential growth keeps early retries close while still bounding the
/// tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Window after the first failure.
    pub base: Duration,
    /// Growth coefficient.
    pub coef: Duration,
    /// Upper bound on the window.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            coef: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
        }
    }
}
