//! Circuit relay client transport.
//!
//! Presents `/p2p-circuit` addresses as a transport of their own. The
//! relay hop itself is opened by a [`RelayDialer`]; this layer adds scope
//! accounting, the security upgrade and gating on top, the same way the
//! direct transport does.

use crate::conn::CapableConn;
use crate::listener::{upgrade_gated_listener, Listener};
use crate::addr::P_CIRCUIT;
use crate::network::TransportNetwork;
use crate::session::{RawListener, RawSession};
use crate::transport::{Closer, SkipResolver, Transport, TransportCore};
use crate::{PeerId, UpgradeError};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::sync::Arc;

/// Opens and receives relayed streams.
#[async_trait::async_trait]
pub trait RelayDialer: Send + Sync {
    /// Open a circuit to `peer` through the relay named in `addr`.
    async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<Arc<dyn RawSession>, anyhow::Error>;

    /// Circuits other peers open to us through our relays.
    fn listener(&self) -> Box<dyn RawListener>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Transport for circuit-relay addresses.
pub struct CircuitTransport {
    core: Arc<TransportCore>,
    relay: Arc<dyn RelayDialer>,
}

impl CircuitTransport {
    pub fn new(core: Arc<TransportCore>, relay: Arc<dyn RelayDialer>) -> Self {
        Self { core, relay }
    }

    pub fn core(&self) -> &Arc<TransportCore> {
        &self.core
    }
}

#[async_trait::async_trait]
impl Transport for CircuitTransport {
    async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<CapableConn, UpgradeError> {
        if !self.can_dial(addr) {
            return Err(UpgradeError::UnsupportedAddr(addr.clone()));
        }
        let mut conn = self
            .core
            .dial_and_upgrade(addr, peer, true, self.relay.dial(addr, peer))
            .await?;
        conn.mark_relayed();
        Ok(conn)
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, UpgradeError> {
        if !self.can_dial(addr) {
            return Err(UpgradeError::UnsupportedAddr(addr.clone()));
        }
        Ok(upgrade_gated_listener(
            self.core.clone(),
            self.relay.listener(),
            None,
            true,
        ))
    }

    fn protocols(&self) -> Vec<u32> {
        vec![P_CIRCUIT]
    }

    fn proxy(&self) -> bool {
        true
    }

    fn skip_resolver(&self) -> Option<&dyn SkipResolver> {
        Some(self)
    }
}

impl SkipResolver for CircuitTransport {
    /// Resolution is left to the inner transport that performs the hop.
    fn skip_resolve(&self, _addr: &Multiaddr) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl Closer for CircuitTransport {
    async fn close(&self) -> Result<(), UpgradeError> {
        self.relay.close().await.map_err(UpgradeError::Close)
    }
}

/// Register `transport` with `network` and start listening for relayed
/// connections on `/p2p-circuit`.
pub async fn add_transport(
    network: &mut TransportNetwork,
    transport: Arc<CircuitTransport>,
) -> Result<Listener, UpgradeError> {
    network.add_transport(transport.clone())?;
    let listener = transport
        .listen(&Multiaddr::from(Protocol::P2pCircuit))
        .await?;
    tracing::info!(local_peer = %transport.core.local_peer(), "circuit transport added");
    Ok(listener)
}
