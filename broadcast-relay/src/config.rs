use std::time::Duration;

/// Connections admitted at once unless `--capacity` says otherwise.
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime knobs for a [`RelayServer`](crate::server::RelayServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum number of admitted connections. Always at least one.
    pub capacity: usize,
    /// How long a new connection may take to complete the greeting exchange.
    pub handshake_timeout: Duration,
    /// Upper bound on a single peer write during fan-out.
    pub write_timeout: Duration,
    /// How long shutdown waits for handler tasks before aborting them.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl RelayConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }
}
