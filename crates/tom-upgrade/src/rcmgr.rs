//! Resource scopes: admission-control tokens for connection attempts.
//!
//! Every dial and accept opens exactly one scope and releases it exactly
//! once. [`ScopeGuard`] carries that obligation: it cannot be cloned,
//! [`ScopeGuard::done`] consumes it, and dropping an unreleased guard
//! releases it. On success the guard moves into the resulting
//! [`CapableConn`](crate::CapableConn), which releases it on close.

use crate::{Direction, PeerId};

use libp2p::Multiaddr;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Admission failures reported by a [`ResourceManager`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("{direction} connection limit of {limit} reached")]
    ConnLimit { direction: Direction, limit: usize },

    #[error("per-peer connection limit of {limit} reached")]
    PeerLimit { limit: usize },

    #[error("scope already bound to peer {0}")]
    PeerAlreadySet(PeerId),
}

/// A resource manager's view of one connection attempt.
pub trait ConnScope: Send + Sync + fmt::Debug {
    /// Attribute the connection to `peer`. May be refused by per-peer limits.
    fn set_peer(&mut self, peer: PeerId) -> Result<(), ResourceError>;

    /// Release everything held by this scope. Called once by [`ScopeGuard`].
    fn done(&mut self);
}

/// Admission control for new connections.
pub trait ResourceManager: Send + Sync {
    fn open_connection(
        &self,
        direction: Direction,
        relayed: bool,
        remote: &Multiaddr,
    ) -> Result<ScopeGuard, ResourceError>;
}

/// Move-only ownership token for a [`ConnScope`].
#[derive(Debug)]
pub struct ScopeGuard {
    scope: Option<Box<dyn ConnScope>>,
    direction: Direction,
    peer: Option<PeerId>,
}

impl ScopeGuard {
    pub fn new(direction: Direction, scope: Box<dyn ConnScope>) -> Self {
        Self {
            scope: Some(scope),
            direction,
            peer: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The peer this scope is bound to, once known.
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: PeerId) -> Result<(), ResourceError> {
        if let Some(scope) = self.scope.as_mut() {
            scope.set_peer(peer)?;
        }
        self.peer = Some(peer);
        Ok(())
    }

    /// Release the scope.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut scope) = self.scope.take() {
            scope.done();
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Admits every connection. Used when no resource manager is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResourceManager;

#[derive(Debug)]
struct NullScope;

impl ConnScope for NullScope {
    fn set_peer(&mut self, _peer: PeerId) -> Result<(), ResourceError> {
        Ok(())
    }

    fn done(&mut self) {}
}

impl ResourceManager for NullResourceManager {
    fn open_connection(
        &self,
        direction: Direction,
        _relayed: bool,
        _remote: &Multiaddr,
    ) -> Result<ScopeGuard, ResourceError> {
        Ok(ScopeGuard::new(direction, Box::new(NullScope)))
    }
}

/// Connection-count limits for [`FixedLimitResourceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnLimits {
    pub inbound: usize,
    pub outbound: usize,
    pub per_peer: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            inbound: 128,
            outbound: 128,
            per_peer: 8,
        }
    }
}

/// Snapshot of what a [`FixedLimitResourceManager`] currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitUsage {
    pub inbound: usize,
    pub outbound: usize,
    pub peers: HashMap<PeerId, usize>,
}

/// Counts open scopes per direction and per peer against fixed limits.
#[derive(Debug, Clone, Default)]
pub struct FixedLimitResourceManager {
    limits: ConnLimits,
    usage: Arc<Mutex<LimitUsage>>,
}

impl FixedLimitResourceManager {
    pub fn new(limits: ConnLimits) -> Self {
        Self {
            limits,
            usage: Arc::default(),
        }
    }

    pub fn usage(&self) -> LimitUsage {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ResourceManager for FixedLimitResourceManager {
    fn open_connection(
        &self,
        direction: Direction,
        relayed: bool,
        remote: &Multiaddr,
    ) -> Result<ScopeGuard, ResourceError> {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, limit) = match direction {
            Direction::Inbound => (&mut usage.inbound, self.limits.inbound),
            Direction::Outbound => (&mut usage.outbound, self.limits.outbound),
        };
        if *count >= limit {
            tracing::debug!(%direction, %remote, relayed, limit, "connection limit reached");
            return Err(ResourceError::ConnLimit { direction, limit });
        }
        *count += 1;

        let scope = LimitScope {
            usage: self.usage.clone(),
            per_peer: self.limits.per_peer,
            direction,
            peer: None,
        };
        Ok(ScopeGuard::new(direction, Box::new(scope)))
    }
}

#[derive(Debug)]
struct LimitScope {
    usage: Arc<Mutex<LimitUsage>>,
    per_peer: usize,
    direction: Direction,
    peer: Option<PeerId>,
}

impl ConnScope for LimitScope {
    fn set_peer(&mut self, peer: PeerId) -> Result<(), ResourceError> {
        if let Some(existing) = self.peer {
            return Err(ResourceError::PeerAlreadySet(existing));
        }
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let count = usage.peers.entry(peer).or_insert(0);
        if *count >= self.per_peer {
            if *count == 0 {
                usage.peers.remove(&peer);
            }
            return Err(ResourceError::PeerLimit {
                limit: self.per_peer,
            });
        }
        *count += 1;
        self.peer = Some(peer);
        Ok(())
    }

    fn done(&mut self) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        match self.direction {
            Direction::Inbound => usage.inbound = usage.inbound.saturating_sub(1),
            Direction::Outbound => usage.outbound = usage.outbound.saturating_sub(1),
        }
        if let Some(peer) = self.peer.take() {
            if let Some(count) = usage.peers.get_mut(&peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    usage.peers.remove(&peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer_id;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counting(Arc<AtomicUsize>);

    impl ConnScope for Counting {
        fn set_peer(&mut self, _peer: PeerId) -> Result<(), ResourceError> {
            Ok(())
        }

        fn done(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap()
    }

    #[test]
    fn done_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let guard = ScopeGuard::new(Direction::Inbound, Box::new(Counting(released.clone())));
        guard.done();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_unreleased_guard() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let _guard =
                ScopeGuard::new(Direction::Outbound, Box::new(Counting(released.clone())));
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_remembers_peer() {
        let mut guard = NullResourceManager
            .open_connection(Direction::Outbound, false, &addr())
            .unwrap();
        assert_eq!(guard.peer(), None);
        let peer = peer_id(5);
        guard.set_peer(peer).unwrap();
        assert_eq!(guard.peer(), Some(peer));
        assert_eq!(guard.direction(), Direction::Outbound);
    }

    #[test]
    fn fixed_limits_reject_over_limit_and_recover() {
        let rcmgr = FixedLimitResourceManager::new(ConnLimits {
            inbound: 1,
            outbound: 1,
            per_peer: 1,
        });
        let first = rcmgr
            .open_connection(Direction::Inbound, false, &addr())
            .unwrap();
        let err = rcmgr
            .open_connection(Direction::Inbound, false, &addr())
            .unwrap_err();
        assert_eq!(
            err,
            ResourceError::ConnLimit {
                direction: Direction::Inbound,
                limit: 1
            }
        );
        first.done();
        assert_eq!(rcmgr.usage().inbound, 0);
        assert!(rcmgr
            .open_connection(Direction::Inbound, false, &addr())
            .is_ok());
    }

    #[test]
    fn fixed_limits_enforce_per_peer() {
        let rcmgr = FixedLimitResourceManager::new(ConnLimits {
            inbound: 4,
            outbound: 4,
            per_peer: 1,
        });
        let peer = peer_id(9);
        let mut a = rcmgr
            .open_connection(Direction::Inbound, false, &addr())
            .unwrap();
        a.set_peer(peer).unwrap();
        let mut b = rcmgr
            .open_connection(Direction::Outbound, false, &addr())
            .unwrap();
        assert_eq!(b.set_peer(peer), Err(ResourceError::PeerLimit { limit: 1 }));
        drop(b);
        assert_eq!(rcmgr.usage().peers.get(&peer), Some(&1));
        a.done();
        let usage = rcmgr.usage();
        assert!(usage.peers.is_empty());
        assert_eq!((usage.inbound, usage.outbound), (0, 0));
    }

    #[test]
    fn scope_cannot_be_rebound() {
        let rcmgr = FixedLimitResourceManager::default();
        let mut guard = rcmgr
            .open_connection(Direction::Inbound, true, &addr())
            .unwrap();
        let peer = peer_id(1);
        guard.set_peer(peer).unwrap();
        assert_eq!(
            guard.set_peer(peer_id(2)),
            Err(ResourceError::PeerAlreadySet(peer))
        );
    }
}
