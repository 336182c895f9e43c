//! In-memory collaborators for exercising listeners and transports
//! without sockets.

use crate::circuit::RelayDialer;
use crate::conn::{CapableConn, ConnParts};
use crate::gater::ConnectionGater;
use crate::identity::{cert_chain_for, peer_id_from_public_key, PublicKey};
use crate::addr::socket_multiaddr;
use crate::rcmgr::{ConnScope, NullResourceManager, ResourceError, ResourceManager, ScopeGuard};
use crate::session::{CloseCode, RawListener, RawSession, RawTransport, SessionVersion};
use crate::upgrader::Upgrader;
use crate::{Direction, PeerId, UpgradeError};

use ed25519_dalek::SigningKey;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use webpki_types::CertificateDer;

/// Deterministic public key for `seed`.
pub fn public_key(seed: u8) -> PublicKey {
    SigningKey::from_bytes(&[seed; 32]).verifying_key()
}

pub fn peer_id(seed: u8) -> PeerId {
    peer_id_from_public_key(&public_key(seed)).unwrap()
}

/// Documentation-range address for peer `seed`.
pub fn remote_addr(seed: u8) -> SocketAddr {
    SocketAddr::from(([203, 0, 113, seed], 4001))
}

pub fn quic_addr(addr: SocketAddr) -> Multiaddr {
    socket_multiaddr(addr, SessionVersion::QuicV1).unwrap()
}

/// `/…/p2p/<relay>/p2p-circuit/p2p/<target>` through relay `relay_seed`.
pub fn circuit_addr(relay_seed: u8, target: PeerId) -> Multiaddr {
    quic_addr(remote_addr(relay_seed))
        .with(Protocol::P2p(peer_id(relay_seed)))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(target))
}

/// A standalone inbound connection from peer `seed`.
pub fn test_conn(seed: u8) -> CapableConn {
    let session = MockSession::new(remote_addr(seed))
        .secured_by(&public_key(seed))
        .into_arc();
    let remote_multiaddr = quic_addr(remote_addr(seed));
    let scope = NullResourceManager
        .open_connection(Direction::Inbound, false, &remote_multiaddr)
        .unwrap();
    CapableConn::new(ConnParts {
        local_multiaddr: quic_addr(session.local_addr()),
        session,
        scope,
        direction: Direction::Inbound,
        local_peer: peer_id(0),
        remote_peer: peer_id(seed),
        remote_public_key: public_key(seed),
        remote_multiaddr,
    })
}

// ── Sessions ────────────────────────────────────────────────────────

/// Raw session that records how it was closed.
#[derive(Debug)]
pub struct MockSession {
    remote: SocketAddr,
    local: SocketAddr,
    version: SessionVersion,
    certs: Vec<CertificateDer<'static>>,
    scope: Mutex<Option<ScopeGuard>>,
    closes: Mutex<Vec<CloseCode>>,
}

impl MockSession {
    /// Unsecured QUIC v1 session from `remote`.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            local: SocketAddr::from(([192, 0, 2, 1], 4001)),
            version: SessionVersion::QuicV1,
            certs: Vec::new(),
            scope: Mutex::new(None),
            closes: Mutex::new(Vec::new()),
        }
    }

    /// Present `key` as the handshake-verified identity.
    pub fn secured_by(mut self, key: &PublicKey) -> Self {
        self.certs = cert_chain_for(key);
        self
    }

    pub fn with_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.certs = certs;
        self
    }

    pub fn with_version(mut self, version: SessionVersion) -> Self {
        self.version = version;
        self
    }

    /// Attach a scope, as a lower layer would before handing the session over.
    pub fn with_scope(self, scope: ScopeGuard) -> Self {
        *self.scope.lock().unwrap() = Some(scope);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn close_codes(&self) -> Vec<CloseCode> {
        self.closes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.closes.lock().unwrap().is_empty()
    }
}

impl RawSession for MockSession {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn version(&self) -> SessionVersion {
        self.version
    }

    fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.certs.clone()
    }

    fn take_scope(&self) -> Option<ScopeGuard> {
        self.scope.lock().unwrap().take()
    }

    fn close_with_error(&self, code: CloseCode, _reason: &str) {
        self.closes.lock().unwrap().push(code);
    }
}

// ── Listener & raw transport ────────────────────────────────────────

type Incoming = Result<Arc<dyn RawSession>, String>;

/// Feeds sessions into a [`MockListener`].
#[derive(Clone)]
pub struct MockListenerHandle {
    tx: mpsc::UnboundedSender<Incoming>,
}

impl MockListenerHandle {
    pub fn push(&self, session: Arc<MockSession>) {
        let _ = self.tx.send(Ok(session));
    }

    /// Make the next `accept` fail with `reason`.
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(reason.to_string()));
    }
}

pub struct MockListener {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    tx: mpsc::UnboundedSender<Incoming>,
    addrs: Vec<Multiaddr>,
}

impl MockListener {
    pub fn new(addrs: Vec<Multiaddr>) -> (Self, MockListenerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            rx: tokio::sync::Mutex::new(rx),
            tx: tx.clone(),
            addrs,
        };
        (listener, MockListenerHandle { tx })
    }
}

#[async_trait::async_trait]
impl RawListener for MockListener {
    async fn accept(&self) -> Result<Arc<dyn RawSession>, anyhow::Error> {
        match self.rx.lock().await.recv().await {
            Some(Ok(session)) => Ok(session),
            Some(Err(reason)) => Err(anyhow::anyhow!(reason)),
            None => Err(anyhow::anyhow!("listener closed")),
        }
    }

    fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.addrs.clone()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let _ = self.tx.send(Err("listener closed".into()));
        Ok(())
    }
}

/// Raw transport with a fixed routing table instead of a network.
#[derive(Default)]
pub struct MockRawTransport {
    routes: Mutex<HashMap<Multiaddr, Arc<MockSession>>>,
    listeners: Mutex<Vec<MockListenerHandle>>,
    dial_delay: Option<Duration>,
    dials: AtomicUsize,
}

impl MockRawTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every dial by `delay` before resolving it.
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = Some(delay);
        self
    }

    /// Dialing `addr` yields `session`. Unrouted addresses are refused.
    pub fn route(&self, addr: Multiaddr, session: Arc<MockSession>) {
        self.routes.lock().unwrap().insert(addr, session);
    }

    /// Handle for the `index`-th listener opened through this transport.
    pub fn listener_handle(&self, index: usize) -> Option<MockListenerHandle> {
        self.listeners.lock().unwrap().get(index).cloned()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RawTransport for MockRawTransport {
    async fn dial(&self, addr: &Multiaddr) -> Result<Arc<dyn RawSession>, anyhow::Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        let session = self.routes.lock().unwrap().get(addr).cloned();
        match session {
            Some(session) => Ok(session),
            None => Err(anyhow::anyhow!("connection refused: {addr}")),
        }
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn RawListener>, anyhow::Error> {
        let (listener, handle) = MockListener::new(vec![addr.clone()]);
        self.listeners.lock().unwrap().push(handle);
        Ok(Box::new(listener))
    }
}

// ── Resource manager ────────────────────────────────────────────────

/// One scope opened through a [`CountingResourceManager`].
#[derive(Debug, Clone)]
pub struct ScopeRecord {
    pub direction: Direction,
    pub relayed: bool,
    releases: Arc<AtomicUsize>,
    peer: Arc<Mutex<Option<PeerId>>>,
}

impl ScopeRecord {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> Option<PeerId> {
        *self.peer.lock().unwrap()
    }
}

#[derive(Debug)]
struct CountingScope {
    releases: Arc<AtomicUsize>,
    peer: Arc<Mutex<Option<PeerId>>>,
    rejected_peer: Option<PeerId>,
}

impl ConnScope for CountingScope {
    fn set_peer(&mut self, peer: PeerId) -> Result<(), ResourceError> {
        if self.rejected_peer == Some(peer) {
            return Err(ResourceError::PeerLimit { limit: 0 });
        }
        *self.peer.lock().unwrap() = Some(peer);
        Ok(())
    }

    fn done(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resource manager that records every scope and counts its releases.
#[derive(Default)]
pub struct CountingResourceManager {
    scopes: Mutex<Vec<ScopeRecord>>,
    reject_open: AtomicBool,
    rejected_peer: Mutex<Option<PeerId>>,
}

impl CountingResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every new scope.
    pub fn reject_all(&self) {
        self.reject_open.store(true, Ordering::SeqCst);
    }

    /// Refuse binding any scope to `peer`.
    pub fn reject_peer(&self, peer: PeerId) {
        *self.rejected_peer.lock().unwrap() = Some(peer);
    }

    pub fn scopes(&self) -> Vec<ScopeRecord> {
        self.scopes.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }

    /// Scopes not yet released.
    pub fn outstanding(&self) -> usize {
        self.scopes().iter().filter(|p| p.releases() == 0).count()
    }

    /// No scope was ever released more than once.
    pub fn never_double_released(&self) -> bool {
        self.scopes().iter().all(|p| p.releases() <= 1)
    }

    /// Every scope was released exactly once.
    pub fn all_released_once(&self) -> bool {
        self.scopes().iter().all(|p| p.releases() == 1)
    }
}

impl ResourceManager for CountingResourceManager {
    fn open_connection(
        &self,
        direction: Direction,
        relayed: bool,
        _remote: &Multiaddr,
    ) -> Result<ScopeGuard, ResourceError> {
        if self.reject_open.load(Ordering::SeqCst) {
            return Err(ResourceError::ConnLimit {
                direction,
                limit: 0,
            });
        }
        let record = ScopeRecord {
            direction,
            relayed,
            releases: Arc::new(AtomicUsize::new(0)),
            peer: Arc::new(Mutex::new(None)),
        };
        let scope = CountingScope {
            releases: record.releases.clone(),
            peer: record.peer.clone(),
            rejected_peer: *self.rejected_peer.lock().unwrap(),
        };
        self.scopes.lock().unwrap().push(record);
        Ok(ScopeGuard::new(direction, Box::new(scope)))
    }
}

// ── Upgrader & gater ────────────────────────────────────────────────

/// Upgrader that "secures" sessions from known addresses with a
/// preconfigured identity, and passes already-secured sessions through.
#[derive(Default)]
pub struct MockUpgrader {
    identities: Mutex<HashMap<SocketAddr, PublicKey>>,
    secured: Mutex<Vec<Arc<MockSession>>>,
    calls: Mutex<Vec<(Direction, Option<PeerId>)>>,
    fail: AtomicBool,
}

impl MockUpgrader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions from `remote` complete the handshake as `key`.
    pub fn expect(&self, remote: SocketAddr, key: PublicKey) {
        self.identities.lock().unwrap().insert(remote, key);
    }

    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(Direction, Option<PeerId>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Sessions this upgrader produced, in order.
    pub fn secured_sessions(&self) -> Vec<Arc<MockSession>> {
        self.secured.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Upgrader for MockUpgrader {
    async fn upgrade(
        &self,
        raw: Arc<dyn RawSession>,
        direction: Direction,
        peer: Option<PeerId>,
        _scope: &mut ScopeGuard,
    ) -> Result<Arc<dyn RawSession>, UpgradeError> {
        self.calls.lock().unwrap().push((direction, peer));
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpgradeError::Handshake(anyhow::anyhow!("mock handshake failed")));
        }
        if !raw.peer_certificates().is_empty() {
            return Ok(raw);
        }
        let key = self
            .identities
            .lock()
            .unwrap()
            .get(&raw.remote_addr())
            .copied()
            .ok_or_else(|| UpgradeError::Handshake(anyhow::anyhow!("no identity for {}", raw.remote_addr())))?;
        let secured = MockSession::new(raw.remote_addr())
            .with_version(raw.version())
            .secured_by(&key)
            .into_arc();
        self.secured.lock().unwrap().push(secured.clone());
        Ok(secured)
    }
}

/// Gater with fixed answers that counts how often it is asked.
pub struct MockGater {
    allow_accept: bool,
    allow_secured: bool,
    denied_peer: Option<PeerId>,
    accept_calls: AtomicUsize,
    secured_calls: AtomicUsize,
}

impl MockGater {
    fn with(allow_accept: bool, allow_secured: bool, denied_peer: Option<PeerId>) -> Self {
        Self {
            allow_accept,
            allow_secured,
            denied_peer,
            accept_calls: AtomicUsize::new(0),
            secured_calls: AtomicUsize::new(0),
        }
    }

    pub fn allow_all() -> Self {
        Self::with(true, true, None)
    }

    pub fn deny_all() -> Self {
        Self::with(false, false, None)
    }

    /// Pass the accept check but refuse once the identity is known.
    pub fn deny_secured() -> Self {
        Self::with(true, false, None)
    }

    pub fn deny_peer(peer: PeerId) -> Self {
        Self::with(true, true, Some(peer))
    }

    pub fn accept_calls(&self) -> usize {
        self.accept_calls.load(Ordering::SeqCst)
    }

    pub fn secured_calls(&self) -> usize {
        self.secured_calls.load(Ordering::SeqCst)
    }
}

impl ConnectionGater for MockGater {
    fn intercept_accept(&self, _conn: &CapableConn) -> bool {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        self.allow_accept
    }

    fn intercept_secured(&self, _direction: Direction, peer: PeerId, _conn: &CapableConn) -> bool {
        self.secured_calls.fetch_add(1, Ordering::SeqCst);
        self.allow_secured && self.denied_peer != Some(peer)
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Relay dialer backed by a routing table keyed by target peer.
#[derive(Default)]
pub struct MockRelayDialer {
    routes: Mutex<HashMap<PeerId, Arc<MockSession>>>,
    listeners: Mutex<Vec<MockListenerHandle>>,
    dials: Mutex<Vec<(Multiaddr, PeerId)>>,
    closed: AtomicBool,
    fail_close: AtomicBool,
}

impl MockRelayDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Circuits to `peer` yield `session`.
    pub fn route(&self, peer: PeerId, session: Arc<MockSession>) {
        self.routes.lock().unwrap().insert(peer, session);
    }

    pub fn listener_handle(&self, index: usize) -> Option<MockListenerHandle> {
        self.listeners.lock().unwrap().get(index).cloned()
    }

    pub fn dials(&self) -> Vec<(Multiaddr, PeerId)> {
        self.dials.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make `close` report a failure.
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RelayDialer for MockRelayDialer {
    async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<Arc<dyn RawSession>, anyhow::Error> {
        self.dials.lock().unwrap().push((addr.clone(), peer));
        let session = self.routes.lock().unwrap().get(&peer).cloned();
        match session {
            Some(session) => Ok(session),
            None => Err(anyhow::anyhow!("relay refused circuit to {peer}")),
        }
    }

    fn listener(&self) -> Box<dyn RawListener> {
        let (listener, handle) = MockListener::new(vec![Multiaddr::from(Protocol::P2pCircuit)]);
        self.listeners.lock().unwrap().push(handle);
        Box::new(listener)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("relay reservation still in use"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
