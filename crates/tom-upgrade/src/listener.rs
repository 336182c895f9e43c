use crate::conn::CapableConn;
use crate::holepunch::{HolePunchKey, HolePunchRegistry};
use crate::session::{CloseCode, RawListener, RawSession, SessionVersion};
use crate::transport::TransportCore;
use crate::{Direction, UpgradeError};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wrap a raw listener so that it yields gated, authenticated connections.
///
/// Used by every transport, so gating behaves the same whether sessions
/// arrive directly or through a relay. `holepunch` lets accepted sessions
/// complete pending hole punches instead of being returned.
pub fn upgrade_gated_listener(
    core: Arc<TransportCore>,
    raw: Box<dyn RawListener>,
    holepunch: Option<HolePunchRegistry>,
    relayed: bool,
) -> Listener {
    let mut local_multiaddrs = HashMap::new();
    for addr in raw.multiaddrs() {
        if addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
            local_multiaddrs.insert(SessionVersion::Circuit, addr);
        } else if addr.iter().any(|p| matches!(p, Protocol::QuicV1)) {
            local_multiaddrs.insert(SessionVersion::QuicV1, addr);
        }
    }

    Listener {
        raw,
        core,
        holepunch,
        relayed,
        local_multiaddrs,
        closed: AtomicBool::new(false),
    }
}

/// Yields new inbound connections.
pub struct Listener {
    raw: Box<dyn RawListener>,
    core: Arc<TransportCore>,
    holepunch: Option<HolePunchRegistry>,
    relayed: bool,
    local_multiaddrs: HashMap<SessionVersion, Multiaddr>,
    closed: AtomicBool,
}

impl Listener {
    /// Wait for the next inbound connection.
    ///
    /// Sessions that fail admission, identity binding or gating are closed
    /// and skipped. Sessions that complete a pending hole punch are handed
    /// to the punching dialer and not returned here. Only an error from
    /// the raw listener ends the loop.
    pub async fn accept(&self) -> Result<CapableConn, UpgradeError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(UpgradeError::ListenerClosed);
            }
            let raw = self.raw.accept().await.map_err(UpgradeError::Accept)?;

            let mut conn = match self.wrap_conn(raw.clone()).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(addr = %raw.remote_addr(), error = %e, "failed to set up connection");
                    raw.close_with_error(CloseCode::ResourceLimitExceeded, "");
                    continue;
                }
            };
            if self.relayed {
                conn.mark_relayed();
            }
            conn.register(&self.core.conns);

            if let Some(gater) = &self.core.gater {
                let remote = conn.remote_peer();
                if !(gater.intercept_accept(&conn)
                    && gater.intercept_secured(Direction::Inbound, remote, &conn))
                {
                    tracing::debug!(peer = %remote, addr = %raw.remote_addr(), "connection gated");
                    conn.close_with_error(CloseCode::Gated, "connection gated");
                    continue;
                }
            }

            let Some(registry) = &self.holepunch else {
                return Ok(conn);
            };
            let key = HolePunchKey::new(raw.remote_addr(), conn.remote_peer());
            match registry.try_deliver(&key, conn) {
                Ok(()) => {
                    tracing::trace!(peer = %key.peer, addr = %key.addr, "delivered connection to hole punch");
                }
                Err(conn) => return Ok(conn),
            }
        }
    }

    /// Addresses this listener accepts on.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.raw.multiaddrs()
    }

    pub async fn close(&self) -> Result<(), UpgradeError> {
        self.closed.store(true, Ordering::Release);
        self.raw.close().await.map_err(UpgradeError::Close)
    }

    /// Acquire a scope for `raw`, secure it, and bind the remote identity.
    async fn wrap_conn(&self, raw: Arc<dyn RawSession>) -> Result<CapableConn, UpgradeError> {
        let remote_multiaddr = raw.remote_multiaddr()?;
        let mut scope = match raw.take_scope() {
            Some(scope) => scope,
            None => self
                .core
                .rcmgr
                .open_connection(Direction::Inbound, self.relayed, &remote_multiaddr)
                .inspect_err(|e| {
                    tracing::debug!(addr = %raw.remote_addr(), error = %e, "resource manager blocked incoming connection");
                })?,
        };

        let secured = match self
            .core
            .upgrader
            .upgrade(raw.clone(), Direction::Inbound, None, &mut scope)
            .await
        {
            Ok(secured) => secured,
            Err(e) => {
                scope.done();
                return Err(e);
            }
        };

        // The accept loop closes `raw` on error; a session the upgrader
        // layered on top of it is closed here.
        self.core
            .wrap_with_scope(
                secured.clone(),
                scope,
                Direction::Inbound,
                None,
                remote_multiaddr,
                |session| self.local_multiaddr(session.version()),
            )
            .inspect_err(|_| {
                if !Arc::ptr_eq(&raw, &secured) {
                    secured.close_with_error(CloseCode::ResourceLimitExceeded, "");
                }
            })
    }

    fn local_multiaddr(&self, version: SessionVersion) -> Result<Multiaddr, UpgradeError> {
        self.local_multiaddrs
            .get(&version)
            .cloned()
            .ok_or(UpgradeError::UnknownVersion(version))
    }
}
