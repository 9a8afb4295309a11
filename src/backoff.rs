//! Time-based suppression of dials to peers that keep failing.
//!
//! Whenever a dial effort for a peer ultimately fails, the peer is added
//! to the backoff registry. Callers that would start a new effort check
//! the registry first and fail fast while the suppression window is
//! open. An effort that is already in flight is never interrupted by the
//! registry: backoff stops new waiters, not the dialer. A successful
//! dial clears the entry.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use libp2p_identity::PeerId;
use tracing::debug;

use crate::config::BackoffConfig;

/// Tracks per-peer dial failure history.
///
/// Thread-safe; all operations are O(1) apart from an occasional sweep
/// of stale entries on write.
#[derive(Debug)]
pub struct DialBackoff {
    config: BackoffConfig,
    entries: Mutex<HashMap<PeerId, BackoffEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    tries: u32,
    until: Instant,
}

impl DialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether dials to `peer` should currently fail fast.
    pub fn is_backoff(&self, peer: &PeerId) -> bool {
        let entries = self.entries.lock().expect("poisoned");
        match entries.get(peer) {
            Some(entry) => Instant::now() < entry.until,
            None => false,
        }
    }

    /// Record a failed dial effort for `peer`.
    ///
    /// The suppression window grows quadratically with the number of
    /// prior failures: `base + coef * tries^2`, capped at `max`.
    pub fn add_backoff(&self, peer: PeerId) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("poisoned");
        // Entries expired for longer than the maximum window carry no
        // useful history anymore.
        entries.retain(|_, entry| now < entry.until + self.config.max);
        match entries.get_mut(&peer) {
            None => {
                entries.insert(
                    peer,
                    BackoffEntry {
                        tries: 1,
                        until: now + self.config.base,
                    },
                );
                debug!(%peer, "backoff added");
            }
            Some(entry) => {
                let window = self.config.base + self.config.coef * (entry.tries * entry.tries);
                entry.until = now + window.min(self.config.max);
                entry.tries += 1;
                debug!(%peer, tries = entry.tries, "backoff extended");
            }
        }
    }

    /// Remove the record for `peer`. Called after a successful dial.
    pub fn clear(&self, peer: &PeerId) {
        let mut entries = self.entries.lock().expect("poisoned");
        if entries.remove(peer).is_some() {
            debug!(%peer, "backoff cleared");
        }
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, peer: &PeerId) -> Option<(u32, Instant)> {
        let entries = self.entries.lock().expect("poisoned");
        entries.get(peer).map(|e| (e.tries, e.until))
    }
}
