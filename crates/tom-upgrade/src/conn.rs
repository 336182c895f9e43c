use crate::identity::PublicKey;
use crate::rcmgr::ScopeGuard;
use crate::session::{CloseCode, RawSession};
use crate::{Direction, PeerId};

use libp2p::Multiaddr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Metadata about an established connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnStat {
    pub direction: Direction,
    /// The connection is tunneled through a circuit relay.
    pub relayed: bool,
    pub opened: Instant,
}

/// The scope of one connection. Shared with the connection table so that
/// whichever side closes first releases it.
type ScopeSlot = Arc<Mutex<Option<ScopeGuard>>>;

fn take_scope(slot: &ScopeSlot) -> Option<ScopeGuard> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Everything needed to build a [`CapableConn`].
pub(crate) struct ConnParts {
    pub session: Arc<dyn RawSession>,
    pub scope: ScopeGuard,
    pub direction: Direction,
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub remote_public_key: PublicKey,
    pub local_multiaddr: Multiaddr,
    pub remote_multiaddr: Multiaddr,
}

/// A secured, authenticated connection to a known peer.
///
/// Owns its resource scope and its session; both are released together
/// when the connection is closed or dropped, or when the owning transport
/// closes its connection table.
#[derive(Debug)]
pub struct CapableConn {
    id: Option<u64>,
    table: Option<Arc<ConnTable>>,
    session: Arc<dyn RawSession>,
    scope: ScopeSlot,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
    stat: ConnStat,
}

impl CapableConn {
    pub(crate) fn new(parts: ConnParts) -> Self {
        Self {
            id: None,
            table: None,
            session: parts.session,
            scope: Arc::new(Mutex::new(Some(parts.scope))),
            local_peer: parts.local_peer,
            remote_peer: parts.remote_peer,
            remote_public_key: parts.remote_public_key,
            local_multiaddr: parts.local_multiaddr,
            remote_multiaddr: parts.remote_multiaddr,
            stat: ConnStat {
                direction: parts.direction,
                relayed: false,
                opened: Instant::now(),
            },
        }
    }

    /// Track this connection in `table` until it closes.
    pub(crate) fn register(&mut self, table: &Arc<ConnTable>) {
        let info = ConnInfo {
            peer: self.remote_peer,
            remote_addr: self.remote_multiaddr.clone(),
            direction: self.stat.direction,
        };
        self.id = Some(table.add(Entry {
            info,
            session: self.session.clone(),
            scope: self.scope.clone(),
        }));
        self.table = Some(table.clone());
    }

    pub(crate) fn mark_relayed(&mut self) {
        self.stat.relayed = true;
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }

    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    pub fn stat(&self) -> ConnStat {
        self.stat
    }

    /// Id in the owning transport's connection table.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn RawSession> {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn close(&mut self) {
        self.close_with_error(CloseCode::Normal, "");
    }

    /// Close the session with `code`, untrack it, and release the scope.
    /// Later calls do nothing.
    pub fn close_with_error(&mut self, code: CloseCode, reason: &str) {
        let Some(scope) = take_scope(&self.scope) else {
            return;
        };
        if let (Some(table), Some(id)) = (self.table.take(), self.id) {
            table.remove(id);
        }
        self.session.close_with_error(code, reason);
        scope.done();
    }
}

impl Drop for CapableConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// What the connection table records for each live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub peer: PeerId,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
}

#[derive(Debug)]
struct Entry {
    info: ConnInfo,
    session: Arc<dyn RawSession>,
    scope: ScopeSlot,
}

/// Active connections of one transport, keyed by a transport-local id.
#[derive(Debug, Default)]
pub struct ConnTable {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Entry>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, entry: Entry) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, entry);
        id
    }

    fn remove(&self, id: u64) -> Option<ConnInfo> {
        self.lock().remove(&id).map(|entry| entry.info)
    }

    pub fn get(&self, id: u64) -> Option<ConnInfo> {
        self.lock().get(&id).map(|entry| entry.info.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Distinct peers with at least one live connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.lock().values().map(|e| e.info.peer).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Close every tracked connection with `code` and forget them. Each
    /// scope is released here, so the connections report closed and a later
    /// close or drop on them does nothing.
    pub(crate) fn close_all(&self, code: CloseCode, reason: &str) -> usize {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let mut closed = 0;
        for entry in drained {
            if let Some(scope) = take_scope(&entry.scope) {
                entry.session.close_with_error(code, reason);
                scope.done();
                closed += 1;
            }
        }
        closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
