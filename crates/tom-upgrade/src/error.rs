use crate::rcmgr::ResourceError;
use crate::session::SessionVersion;
use crate::PeerId;

use libp2p::Multiaddr;

/// Errors returned while establishing ToM connections.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("resource manager rejected connection: {0}")]
    Resource(#[from] ResourceError),

    #[error("invalid peer certificate: {0}")]
    Certificate(String),

    #[error("unknown protocol version: {0}")]
    UnknownVersion(SessionVersion),

    #[error("peer id mismatch: dialed {expected}, handshake proved {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    #[error("dial to {addr} failed: {source}")]
    Dial {
        addr: Multiaddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("listen on {addr} failed: {source}")]
    Listen {
        addr: Multiaddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] anyhow::Error),

    #[error("security handshake failed: {0}")]
    Handshake(#[source] anyhow::Error),

    #[error("transport cannot dial or listen on {0}")]
    UnsupportedAddr(Multiaddr),

    #[error("already punching a hole for {peer} at {addr}")]
    HolePunchInProgress { addr: String, peer: PeerId },

    #[error("hole punch to {peer} at {addr} timed out")]
    HolePunchTimeout { addr: String, peer: PeerId },

    #[error("a transport for protocol {0} is already registered")]
    DuplicateTransport(u32),

    #[error("no transport can dial {0}")]
    NoTransport(Multiaddr),

    #[error("close failed: {0}")]
    Close(#[source] anyhow::Error),

    #[error("listener is closed")]
    ListenerClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_unknown_version() {
        let err = UpgradeError::UnknownVersion(SessionVersion::QuicDraft29);
        assert_eq!(err.to_string(), "unknown protocol version: quic-draft29");
    }

    #[test]
    fn test_display_resource() {
        let err = UpgradeError::from(ResourceError::PeerLimit { limit: 1 });
        assert_eq!(
            err.to_string(),
            "resource manager rejected connection: per-peer connection limit of 1 reached"
        );
    }

    #[test]
    fn test_display_unsupported_addr() {
        let addr: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();
        let err = UpgradeError::UnsupportedAddr(addr);
        assert_eq!(
            err.to_string(),
            "transport cannot dial or listen on /ip4/10.0.0.1/udp/4001/quic-v1"
        );
    }
}
