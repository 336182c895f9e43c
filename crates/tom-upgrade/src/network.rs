use crate::conn::CapableConn;
use crate::addr::{dial_protocol, P_CIRCUIT};
use crate::transport::Transport;
use crate::{PeerId, UpgradeError};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::collections::HashMap;
use std::sync::Arc;

/// The set of transports a node dials and listens with, keyed by the
/// multiaddr protocol each one handles.
#[derive(Default)]
pub struct TransportNetwork {
    transports: HashMap<u32, Arc<dyn Transport>>,
}

impl TransportNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` for all of its protocols.
    ///
    /// Fails without registering anything if one of them is taken.
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) -> Result<(), UpgradeError> {
        let protocols = transport.protocols();
        if protocols.is_empty() {
            return Err(UpgradeError::Config("transport handles no protocols".into()));
        }
        if let Some(taken) = protocols.iter().find(|p| self.transports.contains_key(p)) {
            return Err(UpgradeError::DuplicateTransport(*taken));
        }
        for protocol in protocols {
            self.transports.insert(protocol, transport.clone());
        }
        Ok(())
    }

    /// Pick the transport for `addr`: the circuit transport for any relayed
    /// address, otherwise the owner of the last protocol before `/p2p`.
    pub fn transport_for_dialing(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        let transport = if addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)) {
            self.transports.get(&P_CIRCUIT)
        } else {
            self.transports.get(&dial_protocol(addr)?)
        }?;
        transport.can_dial(addr).then(|| transport.clone())
    }

    /// Whether `addr` should go through name resolution before dialing.
    pub fn should_resolve(&self, addr: &Multiaddr) -> bool {
        match self.transport_for_dialing(addr) {
            Some(transport) => !transport
                .skip_resolver()
                .is_some_and(|resolver| resolver.skip_resolve(addr)),
            None => true,
        }
    }

    pub async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<CapableConn, UpgradeError> {
        let transport = self
            .transport_for_dialing(addr)
            .ok_or_else(|| UpgradeError::NoTransport(addr.clone()))?;
        transport.dial(addr, peer).await
    }

    /// Protocol codes with a registered transport.
    pub fn protocols(&self) -> Vec<u32> {
        let mut protocols: Vec<u32> = self.transports.keys().copied().collect();
        protocols.sort_unstable();
        protocols
    }
}
