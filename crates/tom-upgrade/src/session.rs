//! Raw sessions and the transports that produce them.
//!
//! A raw session is whatever the underlying transport hands us: a QUIC
//! connection whose TLS handshake already completed, or a relayed stream
//! that still needs securing. Implementations are cheap handles; cloning
//! the `Arc` does not duplicate the session.

use crate::addr::socket_multiaddr;
use crate::rcmgr::ScopeGuard;
use crate::UpgradeError;

use libp2p::Multiaddr;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use webpki_types::CertificateDer;

/// Wire protocol version negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionVersion {
    /// QUIC version 1 (RFC 9000).
    QuicV1,
    /// QUIC draft-29. Negotiable by old peers but no longer served.
    QuicDraft29,
    /// A stream tunneled through a circuit relay.
    Circuit,
}

impl fmt::Display for SessionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionVersion::QuicV1 => write!(f, "quic-v1"),
            SessionVersion::QuicDraft29 => write!(f, "quic-draft29"),
            SessionVersion::Circuit => write!(f, "circuit"),
        }
    }
}

/// Application close codes sent to the remote when we drop a session.
///
/// The values match the libp2p connection error codes so remotes can tell
/// admission failures and gating apart in their diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ResourceLimitExceeded,
    Gated,
}

impl CloseCode {
    pub fn code(self) -> u32 {
        match self {
            CloseCode::Normal => 0,
            CloseCode::ResourceLimitExceeded => 0x1001,
            CloseCode::Gated => 0x1007,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCode::Normal => write!(f, "normal"),
            CloseCode::ResourceLimitExceeded => write!(f, "resource limit exceeded"),
            CloseCode::Gated => write!(f, "gated"),
        }
    }
}

/// A session as produced by the underlying transport.
pub trait RawSession: Send + Sync + fmt::Debug {
    fn remote_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    fn version(&self) -> SessionVersion;

    /// Certificates the remote presented, already verified by the handshake.
    /// Empty while the session is unsecured.
    fn peer_certificates(&self) -> Vec<CertificateDer<'static>>;

    /// Take the resource scope a lower layer attached to this session, if any.
    /// Returns `Some` at most once.
    fn take_scope(&self) -> Option<ScopeGuard> {
        None
    }

    fn remote_multiaddr(&self) -> Result<Multiaddr, UpgradeError> {
        socket_multiaddr(self.remote_addr(), self.version())
    }

    fn local_multiaddr(&self) -> Result<Multiaddr, UpgradeError> {
        socket_multiaddr(self.local_addr(), self.version())
    }

    fn close_with_error(&self, code: CloseCode, reason: &str);
}

/// Source of inbound raw sessions.
#[async_trait::async_trait]
pub trait RawListener: Send + Sync {
    /// Wait for the next session. An error means the listener is unusable.
    async fn accept(&self) -> Result<Arc<dyn RawSession>, anyhow::Error>;

    /// Addresses this listener is reachable on.
    fn multiaddrs(&self) -> Vec<Multiaddr>;

    /// Stop accepting; pending `accept` calls return an error.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The raw dial/listen primitives of a network transport.
#[async_trait::async_trait]
pub trait RawTransport: Send + Sync {
    async fn dial(&self, addr: &Multiaddr) -> Result<Arc<dyn RawSession>, anyhow::Error>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn RawListener>, anyhow::Error>;
}
