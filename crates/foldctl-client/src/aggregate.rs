use std::sync::Arc;
use std::time::Duration;

use foldctl_core::view::PeerSnapshot;
use foldctl_core::{FoldError, PeerAddress, PeerFailure};
use futures_util::future::join_all;
use tracing::debug;

use crate::dispatch::{self, RunIntent};
use crate::session::{PeerSession, SessionOptions, SessionState};

/// Fans one logical operation out across a set of peers. Every peer gets an
/// independent session; one peer failing never blocks or fails the others.
pub struct Aggregator {
    sessions: Vec<Arc<PeerSession>>,
}

impl Aggregator {
    pub fn new(peers: Vec<PeerAddress>, opts: SessionOptions) -> Self {
        let sessions = peers
            .into_iter()
            .map(|peer| PeerSession::new(peer, opts.clone()))
            .collect();
        Self { sessions }
    }

    pub fn sessions(&self) -> &[Arc<PeerSession>] {
        &self.sessions
    }

    /// Start every session without waiting; live renderers watch the
    /// sessions come up instead of blocking on them.
    pub fn start(&self) {
        for session in &self.sessions {
            session.start();
        }
    }

    /// Start every session and wait, bounded by one shared timeout, for each
    /// to become usable or terminally fail. Returns per-peer failures only;
    /// the call itself never fails.
    pub async fn connect(&self, overall: Duration) -> Vec<PeerFailure> {
        self.start();
        let waits = self.sessions.iter().map(|session| async move {
            session.wait_live(overall).await.err().map(|error| {
                debug!(peer = %session.name(), error = %error, "peer failed");
                PeerFailure {
                    peer: session.name().to_string(),
                    error,
                }
            })
        });
        join_all(waits).await.into_iter().flatten().collect()
    }

    /// Point-in-time derivation inputs for all peers, address-list order.
    pub async fn snapshots(&self) -> Vec<PeerSnapshot> {
        join_all(self.sessions.iter().map(|s| s.peer_snapshot())).await
    }

    /// Dispatch a run-state intent to every live peer, collecting per-peer
    /// errors independently.
    pub async fn set_run_state(&self, intent: RunIntent, force: bool) -> Vec<PeerFailure> {
        let sends = self.sessions.iter().map(|session| async move {
            if session.state() != SessionState::Live {
                return None;
            }
            dispatch::set_run_state(session, intent, force)
                .await
                .err()
                .map(|error| PeerFailure {
                    peer: session.name().to_string(),
                    error,
                })
        });
        join_all(sends).await.into_iter().flatten().collect()
    }

    /// Close every session within the bounded grace; cancellation must never
    /// stall on an unresponsive peer.
    pub async fn close(&self) {
        join_all(self.sessions.iter().map(|s| s.close())).await;
    }
}

impl Aggregator {
    /// Convenience for single-peer commands.
    pub fn single(&self) -> Result<&Arc<PeerSession>, FoldError> {
        match self.sessions.as_slice() {
            [session] => Ok(session),
            _ => Err(FoldError::InvalidAddress(
                "this command takes exactly one peer".to_string(),
            )),
        }
    }
}
