//! Multiaddr helpers for the protocols connection setup routes on.

use crate::session::SessionVersion;
use crate::UpgradeError;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::{IpAddr, SocketAddr};

/// Multicodec of `/p2p-circuit`.
pub const P_CIRCUIT: u32 = 0x0122;
/// Multicodec of `/quic-v1`.
pub const P_QUIC_V1: u32 = 0x01cd;

/// Multicodec of `protocol`, read back from its binary encoding.
pub fn protocol_code(protocol: &Protocol<'_>) -> u32 {
    let bytes = Multiaddr::empty().with(protocol.clone()).to_vec();
    let mut code = 0u32;
    // The code is an unsigned varint of at most five bytes.
    for (i, byte) in bytes.iter().take(5).enumerate() {
        code |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            break;
        }
    }
    code
}

/// Code of the component that decides which transport dials `addr`: the
/// last one once a trailing `/p2p/<peer>` is dropped.
pub(crate) fn dial_protocol(addr: &Multiaddr) -> Option<u32> {
    let mut addr = addr.clone();
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr.iter().last().map(|p| protocol_code(&p))
}

/// Address of `socket` for a session negotiated with `version`.
pub fn socket_multiaddr(
    socket: SocketAddr,
    version: SessionVersion,
) -> Result<Multiaddr, UpgradeError> {
    let base = Multiaddr::empty()
        .with(Protocol::from(socket.ip()))
        .with(Protocol::Udp(socket.port()));
    match version {
        SessionVersion::QuicV1 => Ok(base.with(Protocol::QuicV1)),
        SessionVersion::Circuit => Ok(base.with(Protocol::QuicV1).with(Protocol::P2pCircuit)),
        other => Err(UpgradeError::UnknownVersion(other)),
    }
}

/// The UDP socket address `addr` starts with, if any.
pub fn to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip = match iter.next()? {
        Protocol::Ip4(ip) => IpAddr::V4(ip),
        Protocol::Ip6(ip) => IpAddr::V6(ip),
        _ => return None,
    };
    match iter.next()? {
        Protocol::Udp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}
