//! Rendezvous between outbound hole punches and inbound accepts.
//!
//! During a hole punch both peers dial each other at once. The side that
//! is punching registers a [`HolePunchTicket`] for (remote address, peer)
//! before racing; when the listener accepts a session matching that key it
//! hands the connection to the ticket instead of surfacing it from
//! `accept`. At most one delivery happens per registration.

use crate::conn::CapableConn;
use crate::{PeerId, UpgradeError};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Rendezvous key: remote socket address (as text) and remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolePunchKey {
    pub addr: String,
    pub peer: PeerId,
}

impl HolePunchKey {
    pub fn new(addr: SocketAddr, peer: PeerId) -> Self {
        Self {
            addr: addr.to_string(),
            peer,
        }
    }
}

struct PendingHolePunch {
    id: u64,
    tx: Option<oneshot::Sender<CapableConn>>,
    fulfilled: bool,
    registered: Instant,
}

struct RegistryInner {
    pending: Mutex<HashMap<HolePunchKey, PendingHolePunch>>,
    next_id: AtomicU64,
    expiry: Duration,
}

/// Table of in-flight hole punches, shared by a transport's dialer and
/// its listeners.
#[derive(Clone)]
pub struct HolePunchRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for HolePunchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePunchRegistry")
            .field("pending", &self.len())
            .field("expiry", &self.inner.expiry)
            .finish()
    }
}

impl HolePunchRegistry {
    /// Records older than `expiry` are treated as abandoned: lookups ignore
    /// them and the next registration prunes them.
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                expiry,
            }),
        }
    }

    /// Register a pending hole punch for `key`.
    ///
    /// Fails if another live hole punch already waits on the same key.
    pub fn register(&self, key: HolePunchKey) -> Result<HolePunchTicket, UpgradeError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.lock();
        let pruned = self.prune(&mut pending);
        let in_progress = pending.contains_key(&key);
        if !in_progress {
            pending.insert(
                key.clone(),
                PendingHolePunch {
                    id,
                    tx: Some(tx),
                    fulfilled: false,
                    registered: Instant::now(),
                },
            );
        }
        drop(pending);

        for stale in &pruned {
            tracing::warn!(addr = %stale.addr, peer = %stale.peer, "pruned stale hole punch record");
        }
        if in_progress {
            return Err(UpgradeError::HolePunchInProgress {
                addr: key.addr,
                peer: key.peer,
            });
        }
        Ok(HolePunchTicket {
            registry: self.clone(),
            key,
            id,
            rx,
        })
    }

    /// Hand `conn` to the hole punch waiting on `key`.
    ///
    /// Gives the connection back if no live, unfulfilled record matches or
    /// the registrant has already stopped waiting.
    pub(crate) fn try_deliver(
        &self,
        key: &HolePunchKey,
        conn: CapableConn,
    ) -> Result<(), CapableConn> {
        let expiry = self.inner.expiry;
        let mut pending = self.lock();
        let record = match pending.get_mut(key) {
            Some(record) if !record.fulfilled && record.registered.elapsed() < expiry => record,
            _ => return Err(conn),
        };
        record.fulfilled = true;
        match record.tx.take() {
            Some(tx) => tx.send(conn),
            None => Err(conn),
        }
    }

    /// Whether a record exists for `key` and has been fulfilled.
    pub fn is_fulfilled(&self, key: &HolePunchKey) -> Option<bool> {
        self.lock().get(key).map(|record| record.fulfilled)
    }

    /// Number of records, including fulfilled ones not yet removed.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, key: &HolePunchKey, id: u64) {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|record| record.id == id) {
            pending.remove(key);
        }
    }

    /// Remove expired records and return their keys.
    fn prune(&self, pending: &mut HashMap<HolePunchKey, PendingHolePunch>) -> Vec<HolePunchKey> {
        let expiry = self.inner.expiry;
        let stale: Vec<HolePunchKey> = pending
            .iter()
            .filter(|(_, record)| record.registered.elapsed() >= expiry)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            pending.remove(key);
        }
        stale
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HolePunchKey, PendingHolePunch>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered hole punch. Dropping the ticket removes its record.
pub struct HolePunchTicket {
    registry: HolePunchRegistry,
    key: HolePunchKey,
    id: u64,
    rx: oneshot::Receiver<CapableConn>,
}

impl HolePunchTicket {
    pub fn key(&self) -> &HolePunchKey {
        &self.key
    }

    /// Wait for the listener to deliver a matching inbound connection.
    ///
    /// Returns `None` if the record was pruned before anything arrived.
    pub async fn recv(&mut self) -> Option<CapableConn> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for HolePunchTicket {
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.id);
    }
}
