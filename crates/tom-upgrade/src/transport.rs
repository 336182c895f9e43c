use crate::addr::{to_socket_addr, P_QUIC_V1};
use crate::cache::{new_cache, Cache};
use crate::config::TransportConfig;
use crate::conn::{CapableConn, ConnParts, ConnTable};
use crate::gater::ConnectionGater;
use crate::holepunch::{HolePunchKey, HolePunchRegistry};
use crate::identity::{peer_id_from_public_key, public_key_from_cert_chain, PublicKey};
use crate::listener::{upgrade_gated_listener, Listener};
use crate::rcmgr::{NullResourceManager, ResourceManager, ScopeGuard};
use crate::session::{CloseCode, RawSession, RawTransport};
use crate::upgrader::{PreSecured, Upgrader};
use crate::{Direction, PeerId, UpgradeError};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::future::Future;
use std::sync::Arc;

/// A way of reaching peers: dial addresses, listen on addresses.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish an authenticated connection to `peer` at `addr`.
    async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<CapableConn, UpgradeError>;

    fn can_dial(&self, addr: &Multiaddr) -> bool;

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, UpgradeError>;

    /// Multiaddr protocol codes this transport handles.
    fn protocols(&self) -> Vec<u32>;

    /// Whether addresses of this transport point somewhere other than the
    /// peer's own network location.
    fn proxy(&self) -> bool;

    fn skip_resolver(&self) -> Option<&dyn SkipResolver> {
        None
    }
}

/// Transports that resolve addresses themselves, later, in an inner transport.
pub trait SkipResolver {
    fn skip_resolve(&self, addr: &Multiaddr) -> bool;
}

#[async_trait::async_trait]
pub trait Closer {
    async fn close(&self) -> Result<(), UpgradeError>;
}

/// State shared by a transport, its dial path and all of its listeners.
pub struct TransportCore {
    pub(crate) local_peer: PeerId,
    pub(crate) rcmgr: Arc<dyn ResourceManager>,
    pub(crate) gater: Option<Arc<dyn ConnectionGater>>,
    pub(crate) upgrader: Arc<dyn Upgrader>,
    pub(crate) conns: Arc<ConnTable>,
    pub(crate) peer_keys: Box<dyn Cache<PeerId, PublicKey>>,
}

impl TransportCore {
    /// Core admitting everything, without gating, for pre-secured sessions.
    pub fn new(local_peer: PeerId, config: &TransportConfig) -> Self {
        Self {
            local_peer,
            rcmgr: Arc::new(NullResourceManager),
            gater: None,
            upgrader: Arc::new(PreSecured),
            conns: Arc::new(ConnTable::new()),
            peer_keys: new_cache(config.key_cache_size),
        }
    }

    pub fn with_resource_manager(mut self, rcmgr: Arc<dyn ResourceManager>) -> Self {
        self.rcmgr = rcmgr;
        self
    }

    pub fn with_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = Some(gater);
        self
    }

    pub fn with_upgrader(mut self, upgrader: Arc<dyn Upgrader>) -> Self {
        self.upgrader = upgrader;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn connections(&self) -> &Arc<ConnTable> {
        &self.conns
    }

    /// Last public key seen for `peer`, if still cached.
    pub fn peer_public_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.peer_keys.peek(peer)
    }

    /// Outbound path shared by every transport: open a scope, bind it to
    /// `peer`, run `raw_dial`, upgrade, and bind the proven identity.
    ///
    /// The scope is released before any error is returned.
    pub(crate) async fn dial_and_upgrade<F>(
        &self,
        addr: &Multiaddr,
        peer: PeerId,
        relayed: bool,
        raw_dial: F,
    ) -> Result<CapableConn, UpgradeError>
    where
        F: Future<Output = Result<Arc<dyn RawSession>, anyhow::Error>> + Send,
    {
        let mut scope = self
            .rcmgr
            .open_connection(Direction::Outbound, relayed, addr)?;
        if let Err(e) = scope.set_peer(peer) {
            tracing::debug!(%peer, %addr, error = %e, "resource manager blocked outgoing connection for peer");
            scope.done();
            return Err(e.into());
        }

        let raw = match raw_dial.await {
            Ok(raw) => raw,
            Err(source) => {
                scope.done();
                return Err(UpgradeError::Dial {
                    addr: addr.clone(),
                    source,
                });
            }
        };

        let secured = match self
            .upgrader
            .upgrade(raw.clone(), Direction::Outbound, Some(peer), &mut scope)
            .await
        {
            Ok(secured) => secured,
            Err(e) => {
                raw.close_with_error(CloseCode::Normal, "upgrade failed");
                scope.done();
                return Err(e);
            }
        };

        let mut conn = self
            .wrap_with_scope(
                secured.clone(),
                scope,
                Direction::Outbound,
                Some(peer),
                addr.clone(),
                |session| session.local_multiaddr(),
            )
            .inspect_err(|_| {
                secured.close_with_error(CloseCode::Normal, "identity check failed");
                if !Arc::ptr_eq(&raw, &secured) {
                    raw.close_with_error(CloseCode::Normal, "identity check failed");
                }
            })?;
        conn.register(&self.conns);
        Ok(conn)
    }

    /// Turn a secured session plus its scope into a [`CapableConn`].
    ///
    /// On failure the scope is released here; the session is left for the
    /// caller to close.
    pub(crate) fn wrap_with_scope(
        &self,
        session: Arc<dyn RawSession>,
        mut scope: ScopeGuard,
        direction: Direction,
        expected: Option<PeerId>,
        remote_multiaddr: Multiaddr,
        local_multiaddr: impl FnOnce(&dyn RawSession) -> Result<Multiaddr, UpgradeError>,
    ) -> Result<CapableConn, UpgradeError> {
        let bound = bind_identity(session.as_ref(), &mut scope, expected, local_multiaddr);
        let (remote_public_key, remote_peer, local_multiaddr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                scope.done();
                return Err(e);
            }
        };

        self.peer_keys.add(remote_peer, remote_public_key);
        Ok(CapableConn::new(ConnParts {
            session,
            scope,
            direction,
            local_peer: self.local_peer,
            remote_peer,
            remote_public_key,
            local_multiaddr,
            remote_multiaddr,
        }))
    }
}

fn bind_identity(
    session: &dyn RawSession,
    scope: &mut ScopeGuard,
    expected: Option<PeerId>,
    local_multiaddr: impl FnOnce(&dyn RawSession) -> Result<Multiaddr, UpgradeError>,
) -> Result<(PublicKey, PeerId, Multiaddr), UpgradeError> {
    // The handshake already verified the chain; this only re-derives the
    // identity from it and is not expected to fail.
    let remote_public_key = public_key_from_cert_chain(&session.peer_certificates())?;
    let remote_peer = peer_id_from_public_key(&remote_public_key)?;

    if let Some(expected) = expected {
        if expected != remote_peer {
            return Err(UpgradeError::PeerMismatch {
                expected,
                actual: remote_peer,
            });
        }
    }

    if scope.peer() != Some(remote_peer) {
        if let Err(e) = scope.set_peer(remote_peer) {
            tracing::debug!(peer = %remote_peer, addr = %session.remote_addr(), error = %e, "resource manager blocked incoming connection for peer");
            return Err(e.into());
        }
    }

    let local_multiaddr = local_multiaddr(session)?;
    Ok((remote_public_key, remote_peer, local_multiaddr))
}

/// Transport for direct QUIC addresses, with hole punching.
pub struct DirectTransport {
    core: Arc<TransportCore>,
    raw: Arc<dyn RawTransport>,
    holepunch: HolePunchRegistry,
    config: TransportConfig,
}

impl DirectTransport {
    pub fn new(
        raw: Arc<dyn RawTransport>,
        core: TransportCore,
        config: TransportConfig,
    ) -> Result<Self, UpgradeError> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(core),
            raw,
            holepunch: HolePunchRegistry::new(config.pending_expiry),
            config,
        })
    }

    pub fn core(&self) -> &Arc<TransportCore> {
        &self.core
    }

    pub fn local_peer(&self) -> PeerId {
        self.core.local_peer
    }

    pub fn connections(&self) -> &Arc<ConnTable> {
        &self.core.conns
    }

    pub fn hole_punch_registry(&self) -> &HolePunchRegistry {
        &self.holepunch
    }

    pub fn peer_public_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.core.peer_public_key(peer)
    }

    /// Connect to `peer` at `addr` while `peer` dials us at the same time.
    ///
    /// Whichever arrives first wins: our own dial, or the peer's inbound
    /// session delivered by a listener. A failed dial keeps waiting for
    /// the inbound side until the hole punch timeout.
    pub async fn hole_punch(
        &self,
        addr: &Multiaddr,
        peer: PeerId,
    ) -> Result<CapableConn, UpgradeError> {
        let socket = to_socket_addr(addr)
            .filter(|_| self.can_dial(addr))
            .ok_or_else(|| UpgradeError::UnsupportedAddr(addr.clone()))?;
        let key = HolePunchKey::new(socket, peer);
        let mut ticket = self.holepunch.register(key.clone())?;

        let dial = self.dial(addr, peer);
        let deadline = tokio::time::sleep(self.config.hole_punch_timeout);
        tokio::pin!(dial, deadline);
        let mut dial_failed = false;

        loop {
            tokio::select! {
                Some(conn) = ticket.recv() => {
                    tracing::debug!(%peer, addr = %key.addr, "hole punch completed by inbound connection");
                    return Ok(conn);
                }
                res = &mut dial, if !dial_failed => match res {
                    Ok(conn) => {
                        tracing::debug!(%peer, addr = %key.addr, "hole punch completed by outbound dial");
                        return Ok(conn);
                    }
                    Err(e) => {
                        tracing::debug!(%peer, addr = %key.addr, error = %e, "hole punch dial failed, waiting for inbound");
                        dial_failed = true;
                    }
                },
                _ = &mut deadline => {
                    return Err(UpgradeError::HolePunchTimeout {
                        addr: key.addr,
                        peer,
                    });
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<CapableConn, UpgradeError> {
        if !self.can_dial(addr) {
            return Err(UpgradeError::UnsupportedAddr(addr.clone()));
        }
        self.core
            .dial_and_upgrade(addr, peer, false, self.raw.dial(addr))
            .await
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.iter().any(|p| matches!(p, Protocol::QuicV1))
            && !addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, UpgradeError> {
        if !self.can_dial(addr) {
            return Err(UpgradeError::UnsupportedAddr(addr.clone()));
        }
        let raw = self
            .raw
            .listen(addr)
            .await
            .map_err(|source| UpgradeError::Listen {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!(%addr, local_peer = %self.core.local_peer, "listening");
        Ok(upgrade_gated_listener(
            self.core.clone(),
            raw,
            Some(self.holepunch.clone()),
            false,
        ))
    }

    fn protocols(&self) -> Vec<u32> {
        vec![P_QUIC_V1]
    }

    fn proxy(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
impl Closer for DirectTransport {
    /// Close every connection this transport tracks.
    async fn close(&self) -> Result<(), UpgradeError> {
        let closed = self.core.conns.close_all(CloseCode::Normal, "transport closed");
        tracing::info!(closed, "direct transport closed");
        Ok(())
    }
}
