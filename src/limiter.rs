//! Concurrency gate for address-level dial jobs.
//!
//! The limiter admits [`DialJob`]s subject to two caps: a global cap on
//! dials over fd-consuming transports, and a per-peer cap on dials over
//! any transport. Tokens are acquired in a fixed order, per-peer first
//! and then fd-global, so the two queues cannot deadlock each other.
//! Jobs blocked on a cap are parked and woken as tokens free up; the
//! limiter makes no promise about the order in which parked jobs wake.
//!
//! Admitted jobs run as spawned tasks. A finished job posts its result
//! to the job's sink; a job whose cancel token fired posts nothing and
//! closes its connection itself if one materialized anyway.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{conn::BoxedConn, transport::Transport};

/// One queued address dial.
#[derive(derive_more::Debug)]
pub(crate) struct DialJob {
    pub peer: PeerId,
    pub addr: Multiaddr,
    pub transport: Arc<dyn Transport>,
    /// Where the outcome of this dial is posted.
    #[debug(skip)]
    pub tx: mpsc::Sender<DialResult>,
    pub cancel: CancellationToken,
}

impl DialJob {
    fn consumes_fd(&self) -> bool {
        self.transport.consumes_fd()
    }
}

/// Outcome of one address dial.
#[derive(Debug)]
pub(crate) struct DialResult {
    pub addr: Multiaddr,
    pub result: anyhow::Result<BoxedConn>,
}

/// Global and per-peer concurrency gate over dial jobs.
#[derive(Debug, Clone)]
pub(crate) struct DialLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    fd_limit: usize,
    per_peer_limit: usize,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Dials over fd-consuming transports currently in flight.
    fd_consuming: usize,
    /// Dials currently in flight per peer, over any transport.
    active_per_peer: HashMap<PeerId, usize>,
    /// Jobs holding a per-peer token, blocked on the fd cap.
    waiting_on_fd: VecDeque<DialJob>,
    /// Jobs blocked on their peer's cap; no tokens held.
    waiting_on_peer_limit: HashMap<PeerId, VecDeque<DialJob>>,
}

impl DialLimiter {
    pub fn new(fd_limit: usize, per_peer_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                fd_limit,
                per_peer_limit,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Admit a job, parking it if a cap is hit.
    pub fn add_dial_job(&self, job: DialJob) {
        let mut state = self.inner.state.lock().expect("poisoned");
        self.add_check_peer_limit(&mut state, job);
    }

    /// Drop all jobs for `peer` parked on its per-peer cap.
    ///
    /// In-flight jobs are not touched; they observe their cancel token.
    /// Jobs of the peer parked on the fd cap are skipped once a token
    /// would wake them, because their token is cancelled by then.
    pub fn clear_all_peer_dials(&self, peer: &PeerId) {
        let mut state = self.inner.state.lock().expect("poisoned");
        if state.waiting_on_peer_limit.remove(peer).is_some() {
            trace!(%peer, "cleared parked dials");
        }
    }

    fn add_check_peer_limit(&self, state: &mut State, job: DialJob) {
        let active = state.active_per_peer.get(&job.peer).copied().unwrap_or(0);
        if active >= self.inner.per_peer_limit {
            trace!(peer = %job.peer, addr = %job.addr, "parking dial, peer cap reached");
            state
                .waiting_on_peer_limit
                .entry(job.peer)
                .or_default()
                .push_back(job);
            return;
        }
        *state.active_per_peer.entry(job.peer).or_default() += 1;
        self.add_check_fd_limit(state, job);
    }

    fn add_check_fd_limit(&self, state: &mut State, job: DialJob) {
        if job.consumes_fd() {
            if state.fd_consuming >= self.inner.fd_limit {
                trace!(peer = %job.peer, addr = %job.addr, "parking dial, fd cap reached");
                state.waiting_on_fd.push_back(job);
                return;
            }
            state.fd_consuming += 1;
        }
        self.execute_dial(job);
    }

    /// Release the tokens `job` held and wake one parked job per freed
    /// token, per-peer queue first.
    fn finished_dial(&self, job: &DialJob) {
        let mut state = self.inner.state.lock().expect("poisoned");
        self.free_peer_token(&mut state, job);
        if job.consumes_fd() {
            self.free_fd_token(&mut state);
        }
    }

    fn free_fd_token(&self, state: &mut State) {
        state.fd_consuming -= 1;
        if let Some(next) = state.waiting_on_fd.pop_front() {
            // The parked job already holds its per-peer token.
            state.fd_consuming += 1;
            self.execute_dial(next);
        }
    }

    fn free_peer_token(&self, state: &mut State, job: &DialJob) {
        match state.active_per_peer.get_mut(&job.peer) {
            Some(active) if *active > 1 => *active -= 1,
            _ => {
                state.active_per_peer.remove(&job.peer);
            }
        }
        let next = match state.waiting_on_peer_limit.get_mut(&job.peer) {
            Some(queue) => {
                let next = queue.pop_front();
                if queue.is_empty() {
                    state.waiting_on_peer_limit.remove(&job.peer);
                }
                next
            }
            None => None,
        };
        if let Some(next) = next {
            *state.active_per_peer.entry(next.peer).or_default() += 1;
            self.add_check_fd_limit(state, next);
        }
    }

    /// Run a job that holds all the tokens it needs. Never blocks; the
    /// dial itself happens on a spawned task, outside the state lock.
    fn execute_dial(&self, job: DialJob) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_dial(&job).await;
            this.finished_dial(&job);
        });
    }

    async fn run_dial(&self, job: &DialJob) {
        if job.cancel.is_cancelled() {
            return;
        }
        trace!(peer = %job.peer, addr = %job.addr, "executing dial");
        let dial = job.transport.dial(job.addr.clone(), job.peer);
        let result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                trace!(peer = %job.peer, addr = %job.addr, "dial cancelled in flight");
                return;
            }
            result = dial => result,
        };
        match result {
            Ok(conn) => {
                if job.cancel.is_cancelled() {
                    // We lost the race; our garbage, our cleanup.
                    trace!(peer = %job.peer, addr = %job.addr, "closing connection, race is over");
                    conn.close();
                    return;
                }
                let outcome = DialResult {
                    addr: job.addr.clone(),
                    result: Ok(conn),
                };
                if let Err(unsent) = job.tx.send(outcome).await {
                    // Nobody is listening for this result anymore.
                    if let Ok(conn) = unsent.0.result {
                        trace!(peer = %job.peer, addr = %job.addr, "closing unwanted connection");
                        conn.close();
                    }
                }
            }
            Err(err) => {
                let outcome = DialResult {
                    addr: job.addr.clone(),
                    result: Err(err),
                };
                let _ = job.tx.send(outcome).await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fd_consuming(&self) -> usize {
        self.inner.state.lock().expect("poisoned").fd_consuming
    }

    #[cfg(test)]
    pub(crate) fn active_for_peer(&self, peer: &PeerId) -> usize {
        let state = self.inner.state.lock().expect("poisoned");
        state.active_per_peer.get(peer).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn parked_for_peer(&self, peer: &PeerId) -> usize {
        let state = self.inner.state.lock().expect("poisoned");
        state
            .waiting_on_peer_limit
            .get(peer)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
