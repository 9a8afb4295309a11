//! Single-flight coordination of concurrent dial requests per peer.
//!
//! Many callers may ask for a connection to the same peer at once. The
//! first becomes the leader and spawns the actual dial effort as an
//! independent task; everyone else joins as a follower and awaits a
//! shared handle to the same task. Dropping a follower never cancels
//! the effort for the others; the task is aborted only once the last
//! interested caller is gone. Every caller observes a terminal result.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use libp2p_identity::PeerId;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::trace;

use crate::{conn::SwarmConn, error::DialError};

type DialOutcome = Result<SwarmConn, DialError>;

/// Per-peer single-flight table.
#[derive(Debug, Default, Clone)]
pub(crate) struct DialSync {
    dials: Arc<Mutex<HashMap<PeerId, ActiveDial>>>,
}

impl DialSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a connection to `peer`, coalescing onto an in-flight
    /// effort if one exists, or becoming the leader and running `dial`
    /// as the effort for everyone.
    pub async fn dial_lock<F>(&self, peer: PeerId, dial: F) -> DialOutcome
    where
        F: Future<Output = DialOutcome> + Send + 'static,
    {
        match self.acquire(peer, dial).await {
            Ok(outcome) => outcome,
            // The effort was aborted: the last caller (us, or everyone
            // at once) went away mid-flight.
            Err(_join_err) => Err(DialError::Cancelled),
        }
    }

    fn acquire<F>(&self, peer: PeerId, dial: F) -> DialHandle
    where
        F: Future<Output = DialOutcome> + Send + 'static,
    {
        let mut dials = self.dials.lock().expect("poisoned");
        if let Some(active) = dials.get(&peer) {
            if let Some(handle) = active.join() {
                trace!(%peer, "joining in-flight dial");
                return handle;
            }
            // The previous effort was aborted before cleaning up after
            // itself; replace it.
        }
        trace!(%peer, "starting new dial effort");
        let table = Arc::clone(&self.dials);
        let task = tokio::spawn(async move {
            let outcome = dial.await;
            table.lock().expect("poisoned").remove(&peer);
            outcome
        });
        let (handle, active) = DialHandle::new(task);
        dials.insert(peer, active);
        handle
    }
}

/// Entry for an in-flight effort. Holds the shared result without
/// keeping the effort alive: only [`DialHandle`]s held by callers do
/// that.
#[derive(Debug, Clone)]
struct ActiveDial {
    fut: Shared<BoxFuture<'static, Result<DialOutcome, String>>>,
    abort: Weak<AbortHandle>,
}

impl ActiveDial {
    fn join(&self) -> Option<DialHandle> {
        let abort = self.abort.upgrade()?;
        Some(DialHandle {
            fut: self.fut.clone(),
            abort,
        })
    }
}

/// Caller-held handle to the shared dial task. Cloneable; aborts the
/// task when the last clone is dropped.
#[derive(Debug, Clone)]
struct DialHandle {
    fut: Shared<BoxFuture<'static, Result<DialOutcome, String>>>,
    abort: Arc<AbortHandle>,
}

impl DialHandle {
    fn new(task: JoinHandle<DialOutcome>) -> (Self, ActiveDial) {
        let abort = Arc::new(task.abort_handle());
        let fut: BoxFuture<'static, Result<DialOutcome, String>> =
            Box::pin(async move { task.await.map_err(|e| e.to_string()) });
        let fut = fut.shared();
        let active = ActiveDial {
            fut: fut.clone(),
            abort: Arc::downgrade(&abort),
        };
        (Self { fut, abort }, active)
    }
}

impl Future for DialHandle {
    type Output = Result<DialOutcome, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.fut).poll(cx)
    }
}

impl Drop for DialHandle {
    fn drop(&mut self) {
        if Arc::strong_count(&self.abort) == 1 {
            self.abort.abort();
        }
    }
}
