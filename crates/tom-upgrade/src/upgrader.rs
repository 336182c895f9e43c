use crate::rcmgr::ScopeGuard;
use crate::session::RawSession;
use crate::{Direction, PeerId, UpgradeError};

use std::sync::Arc;

/// Secure-channel and multiplexing handshake over a raw session.
///
/// The upgrader borrows the scope so it can attribute the attempt, but it
/// cannot release it: on failure the caller still owns the guard and the
/// raw session and cleans both up.
#[async_trait::async_trait]
pub trait Upgrader: Send + Sync {
    /// Returns a session whose `peer_certificates` carry the verified
    /// remote identity. `peer` is the expected remote for outbound attempts.
    async fn upgrade(
        &self,
        raw: Arc<dyn RawSession>,
        direction: Direction,
        peer: Option<PeerId>,
        scope: &mut ScopeGuard,
    ) -> Result<Arc<dyn RawSession>, UpgradeError>;
}

/// Upgrader for transports whose sessions complete their TLS handshake
/// before we see them (QUIC). Passes secured sessions through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreSecured;

#[async_trait::async_trait]
impl Upgrader for PreSecured {
    async fn upgrade(
        &self,
        raw: Arc<dyn RawSession>,
        _direction: Direction,
        _peer: Option<PeerId>,
        _scope: &mut ScopeGuard,
    ) -> Result<Arc<dyn RawSession>, UpgradeError> {
        if raw.peer_certificates().is_empty() {
            return Err(UpgradeError::Certificate(
                "session arrived without a completed handshake".into(),
            ));
        }
        Ok(raw)
    }
}
