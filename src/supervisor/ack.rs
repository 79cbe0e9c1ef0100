//! Acknowledgment tracking for outstanding commands.
//!
//! The server answers every command with a bare `ok` and no request id, in
//! the order the commands arrived. Each sent command registers a completion
//! token here before its datagram goes out; the receiver side resolves
//! tokens strictly front to back.
//!
//! A waiter that gives up (timeout) drops its receiver but its slot stays
//! queued, so the late `ok` is absorbed by that slot instead of being
//! credited to whichever command was sent next.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use super::error::ManagerError;

struct Pending {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// FIFO of completion tokens, one per in-flight command.
#[derive(Default)]
pub struct AckQueue {
    next_id: AtomicU64,
    pending: Mutex<VecDeque<Pending>>,
}

/// Handed to the caller that sent a command; resolves when its `ok` arrives.
#[derive(Debug)]
pub struct AckToken {
    id: u64,
    verb: &'static str,
    rx: oneshot::Receiver<()>,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<Pending>>, ManagerError> {
        self.pending.lock().map_err(|e| {
            tracing::error!("AckQueue lock poisoned: {}", e);
            ManagerError::LockPoisoned
        })
    }

    /// Queue a token for a command about to be sent.
    pub fn register(&self, verb: &'static str) -> Result<AckToken, ManagerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock()?.push_back(Pending { id, tx });
        Ok(AckToken { id, verb, rx })
    }

    /// Resolve the oldest outstanding token. Returns its request id, or
    /// `None` for an `ok` nobody was waiting for.
    pub fn resolve_next(&self) -> Option<u64> {
        let front = match self.lock() {
            Ok(mut pending) => pending.pop_front(),
            Err(_) => return None,
        };
        let Some(Pending { id, tx }) = front else {
            tracing::warn!("Received acknowledgment with no command outstanding");
            return None;
        };
        if tx.send(()).is_err() {
            tracing::debug!("Late acknowledgment for abandoned request {}", id);
        }
        Some(id)
    }

    /// Withdraw a token whose command never reached the server.
    pub fn cancel(&self, id: u64) {
        if let Ok(mut pending) = self.lock() {
            pending.retain(|p| p.id != id);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop every pending token. Their waiters fail with `ChannelClosed`.
    pub fn clear(&self) {
        if let Ok(mut pending) = self.lock() {
            if !pending.is_empty() {
                tracing::debug!("Abandoning {} outstanding acknowledgments", pending.len());
            }
            pending.clear();
        }
    }
}

impl AckToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the acknowledgment. `None` waits forever.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<(), ManagerError> {
        let verb = self.verb;
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| ManagerError::CommandTimedOut { verb, timeout: limit })?,
            None => self.rx.await,
        };
        received.map_err(|_| ManagerError::ChannelClosed)
    }
}
