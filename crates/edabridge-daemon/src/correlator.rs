//! Outbound call correlation.
//!
//! Each outbound request registers a [`PendingCall`] keyed by its id. The
//! reader resolves it when the matching response arrives; timeouts and
//! connection loss settle it otherwise. Whatever settles a call first wins,
//! and the entry is gone afterwards, so a late response finds nothing.
//! Once [`RpcCorrelator::fail_all`] has run the correlator is closed and
//! later registrations settle as `Disconnected` straight away.

use edabridge_core::{RemoteError, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome = Result<Value, RpcError>;

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<String, oneshot::Sender<Outcome>>,
    closed: bool,
}

/// Pending calls of one connection.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    table: Mutex<Table>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call. The id must not already be outstanding.
    pub fn register(self: &Arc<Self>, id: impl Into<String>, method: impl Into<String>) -> PendingCall {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.lock();
            if table.closed {
                let _ = tx.send(Err(RpcError::Disconnected));
            } else if table.pending.insert(id.clone(), tx).is_some() {
                tracing::warn!("Call id {} registered twice; the earlier call is abandoned", id);
            }
        }
        PendingCall {
            id,
            method: method.into(),
            rx,
            owner: self.clone(),
        }
    }

    /// Settle the call `id` with a peer response. Returns false if no such
    /// call is outstanding (already timed out, or never sent).
    pub fn resolve(&self, id: &str, outcome: Result<Value, RemoteError>) -> bool {
        match self.lock().pending.remove(id) {
            Some(tx) => {
                let _ = tx.send(outcome.map_err(RpcError::from));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding call with `Disconnected` and close the
    /// correlator.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Disconnected));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    fn forget(&self, id: &str) {
        self.lock().pending.remove(id);
    }
}

/// Caller side of a registered call. Dropping it removes the entry.
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    method: String,
    rx: oneshot::Receiver<Outcome>,
    owner: Arc<RpcCorrelator>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the outcome, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, RpcError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => Err(RpcError::Timeout {
                method: self.method.clone(),
                timeout,
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.owner.forget(&self.id);
    }
}
