//! ToM connection establishment.
//!
//! Turns raw transport sessions into authenticated, resource-accounted
//! [`CapableConn`]s:
//!
//! - [`Listener`] accepts sessions, acquires a resource scope, binds the
//!   remote identity, applies the [`ConnectionGater`], and hands sessions
//!   that complete a pending hole punch to the punching dialer.
//! - [`DirectTransport`] dials QUIC addresses and runs hole punches.
//! - [`CircuitTransport`] does the same for `/p2p-circuit` relay addresses.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tom_upgrade::{DirectTransport, Multiaddr, PeerId, RawTransport, Transport, TransportConfig, TransportCore};
//!
//! # async fn example(raw: Arc<dyn RawTransport>, me: PeerId, them: PeerId) -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::new();
//! let core = TransportCore::new(me, &config);
//! let transport = DirectTransport::new(raw, core, config)?;
//!
//! let listen_addr: Multiaddr = "/ip4/0.0.0.0/udp/4001/quic-v1".parse()?;
//! let listener = transport.listen(&listen_addr).await?;
//!
//! let remote: Multiaddr = "/ip4/203.0.113.5/udp/4001/quic-v1".parse()?;
//! let conn = transport.dial(&remote, them).await?;
//! println!("connected to {}", conn.remote_peer());
//!
//! let inbound = listener.accept().await?;
//! println!("accepted {}", inbound.remote_peer());
//! # Ok(())
//! # }
//! ```

mod addr;
mod cache;
mod circuit;
mod config;
mod conn;
mod error;
mod gater;
mod holepunch;
mod identity;
mod listener;
mod network;
mod rcmgr;
mod session;
mod transport;
mod upgrader;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use addr::{protocol_code, socket_multiaddr, to_socket_addr, P_CIRCUIT, P_QUIC_V1};
pub use cache::{new_cache, BoundedCache, Cache, NoopCache};
pub use circuit::{add_transport, CircuitTransport, RelayDialer};
pub use config::TransportConfig;
pub use conn::{CapableConn, ConnInfo, ConnStat, ConnTable};
pub use error::UpgradeError;
pub use gater::ConnectionGater;
pub use holepunch::{HolePunchKey, HolePunchRegistry, HolePunchTicket};
pub use identity::{cert_chain_for, peer_id_from_public_key, public_key_from_cert_chain, PublicKey};
pub use listener::{upgrade_gated_listener, Listener};
pub use network::TransportNetwork;
pub use rcmgr::{
    ConnLimits, ConnScope, FixedLimitResourceManager, LimitUsage, NullResourceManager,
    ResourceError, ResourceManager, ScopeGuard,
};
pub use session::{CloseCode, RawListener, RawSession, RawTransport, SessionVersion};
pub use transport::{Closer, DirectTransport, SkipResolver, Transport, TransportCore};
pub use upgrader::{PreSecured, Upgrader};

// Re-export the libp2p address and identity types used throughout the API
pub use libp2p::multiaddr::Protocol;
pub use libp2p::{Multiaddr, PeerId};

use std::fmt;

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}
