//! Correlation table for request/response calls.
//!
//! Each outstanding `call` owns one entry keyed by its correlation id. The
//! entry is a oneshot sender; the caller holds the matching [`PendingReply`].
//! A reply and a timeout race for the same entry and exactly one of them wins:
//! `resolve` removes the entry before sending, and dropping the
//! `PendingReply` removes whatever is left.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::{BrokerError, Result};

type Waiters = HashMap<String, oneshot::Sender<Bytes>>;

/// Registry of pending calls, private to one broker instance.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    waiters: Arc<Mutex<Waiters>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`.
    ///
    /// Fails if `id` already has an outstanding entry.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingReply> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        let mut waiters = self.lock();
        if waiters.contains_key(&id) {
            return Err(BrokerError::DuplicateCorrelation(id));
        }
        waiters.insert(id.clone(), tx);

        Ok(PendingReply {
            id,
            rx,
            table: self.clone(),
        })
    }

    /// Deliver a reply to the waiter registered under `id`.
    ///
    /// Returns `false` when no entry exists, e.g. for a reply arriving after
    /// its call already timed out.
    pub fn resolve(&self, id: &str, payload: Bytes) -> bool {
        // Sent under the lock so a timing-out waiter sees either the entry or the payload.
        let mut waiters = self.lock();
        match waiters.remove(id) {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(id = %id, "No pending call for reply, dropping");
                false
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every pending entry. Waiters fail with `NotConnected`.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Remove the entry for `id`. Returns whether it was still present.
    fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }
}

/// Caller side of one correlation entry.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Bytes>,
    table: CorrelationTable,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply payload, or fail with `Timeout` after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(BrokerError::NotConnected),
            Err(_) => {
                let timed_out = BrokerError::Timeout {
                    id: self.id.clone(),
                    after: timeout,
                };
                if self.table.remove(&self.id) {
                    return Err(timed_out);
                }
                // Resolved between the deadline and the removal: the reply wins.
                self.rx.try_recv().map_err(|_| timed_out)
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
