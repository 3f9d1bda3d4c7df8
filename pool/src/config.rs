use core::time::Duration;

use crate::timeout::TimeoutConfig;

/// Configuration of connection pool. See [PoolBuilder](crate::PoolBuilder) for setting it up.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) timeout: TimeoutConfig,
    /// Max number of physical connections opened at the same time.
    /// Default to 128.
    pub(crate) max_connections: usize,
    /// Max number of requests waiting for a stream at the same time.
    /// Default to 10_000.
    pub(crate) max_pending_acquires: usize,
    /// Duration a connection without any active stream is kept alive.
    /// Default to 600 seconds.
    pub(crate) keep_alive_idle: Duration,
    /// Duration a connection is allowed to live since it's creation.
    /// Default to 3600 seconds.
    pub(crate) keep_alive_born: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            timeout: TimeoutConfig::new(),
            max_connections: 128,
            max_pending_acquires: 10_000,
            keep_alive_idle: Duration::from_secs(600),
            keep_alive_born: Duration::from_secs(3600),
        }
    }

    pub const fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout
    }
}
