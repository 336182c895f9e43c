use crate::UpgradeError;

use std::time::Duration;

/// Configuration for a [`DirectTransport`](crate::DirectTransport) and its
/// listeners.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use tom_upgrade::TransportConfig;
///
/// let config = TransportConfig::new()
///     .hole_punch_timeout(Duration::from_secs(3))
///     .key_cache_size(0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long an outbound hole punch waits for either path to succeed.
    pub(crate) hole_punch_timeout: Duration,
    /// Age after which an unfulfilled hole punch record is pruned.
    pub(crate) pending_expiry: Duration,
    /// Capacity of the remote public-key cache. Zero disables it.
    pub(crate) key_cache_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    ///
    /// If the `TOM_HOLE_PUNCH_TIMEOUT_MS` environment variable is set, it is
    /// used as the hole punch timeout. This can be overridden with
    /// [`.hole_punch_timeout()`](Self::hole_punch_timeout).
    pub fn new() -> Self {
        let hole_punch_timeout = std::env::var("TOM_HOLE_PUNCH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        Self {
            hole_punch_timeout,
            pending_expiry: hole_punch_timeout * 2,
            key_cache_size: 256,
        }
    }

    /// Set the hole punch timeout (default: 5 s).
    ///
    /// Raises the pending-record expiry if it would fall below the timeout.
    pub fn hole_punch_timeout(mut self, timeout: Duration) -> Self {
        self.hole_punch_timeout = timeout;
        self.pending_expiry = self.pending_expiry.max(timeout);
        self
    }

    /// Set how long an unfulfilled hole punch record may live (default: twice the timeout).
    pub fn pending_expiry(mut self, expiry: Duration) -> Self {
        self.pending_expiry = expiry;
        self
    }

    /// Set the remote public-key cache capacity (default: 256, 0 disables).
    pub fn key_cache_size(mut self, entries: usize) -> Self {
        self.key_cache_size = entries;
        self
    }

    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.hole_punch_timeout.is_zero() {
            return Err(UpgradeError::Config("hole punch timeout must be non-zero".into()));
        }
        if self.pending_expiry < self.hole_punch_timeout {
            return Err(UpgradeError::Config(format!(
                "pending expiry {:?} is shorter than the hole punch timeout {:?}",
                self.pending_expiry, self.hole_punch_timeout
            )));
        }
        Ok(())
    }
}
