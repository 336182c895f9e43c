use crate::conn::CapableConn;
use crate::{Direction, PeerId};

/// Policy hook that can veto connections.
///
/// Listeners consult both checks on every wrapped inbound connection; a
/// `false` from either closes it with [`CloseCode::Gated`](crate::CloseCode::Gated).
pub trait ConnectionGater: Send + Sync {
    /// Called for every inbound connection before it is surfaced.
    fn intercept_accept(&self, conn: &CapableConn) -> bool;

    /// Called once the remote identity is known.
    fn intercept_secured(&self, direction: Direction, peer: PeerId, conn: &CapableConn) -> bool;
}
