use core::time::Duration;

use crate::{
    config::Config,
    executor::RequestExecutor,
    policy::LimitedProvider,
    pool::Pool,
    timeout::TimeoutConfig,
    transport::Provider,
};

/// Builder type for [RequestExecutor]. Offer configurations before a pool instance is created.
#[derive(Debug, Clone, Copy)]
pub struct PoolBuilder {
    config: Config,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    pub const fn new() -> Self {
        Self { config: Config::new() }
    }

    /// Set timeout for waiting a stream from pool.
    ///
    /// Default to 10 seconds.
    pub fn set_acquire_timeout(mut self, dur: Duration) -> Self {
        self.config.timeout.acquire_timeout = dur;
        self
    }

    /// Set timeout for a single write of request head or body chunk.
    ///
    /// Default to 30 seconds.
    pub fn set_write_timeout(mut self, dur: Duration) -> Self {
        self.config.timeout.write_timeout = dur;
        self
    }

    /// Set timeout for a single read of response data.
    ///
    /// Default to 30 seconds.
    pub fn set_read_timeout(mut self, dur: Duration) -> Self {
        self.config.timeout.read_timeout = dur;
        self
    }

    /// Set timeout for interim response of `Expect: 100-continue` request.
    ///
    /// Default to 1 second.
    pub fn set_expect_continue_timeout(mut self, dur: Duration) -> Self {
        self.config.timeout.expect_continue_timeout = dur;
        self
    }

    /// Set timeout for closing pool.
    ///
    /// Default to 5 seconds.
    pub fn set_shutdown_timeout(mut self, dur: Duration) -> Self {
        self.config.timeout.shutdown_timeout = dur;
        self
    }

    /// Set [TimeoutConfig] for pool.
    pub fn set_timeout(mut self, timeout_config: TimeoutConfig) -> Self {
        self.config.timeout = timeout_config;
        self
    }

    /// Set max number of physical connections opened at the same time.
    ///
    /// Default to 128
    ///
    /// # Panics:
    /// When pass 0 as max connections.
    pub fn set_max_connections(mut self, max: usize) -> Self {
        assert_ne!(max, 0);
        self.config.max_connections = max;
        self
    }

    /// Set max number of requests waiting for a stream at the same time.
    ///
    /// Default to 10_000
    pub fn set_max_pending_acquires(mut self, max: usize) -> Self {
        self.config.max_pending_acquires = max;
        self
    }

    /// Set duration a connection without active stream is kept in pool.
    ///
    /// Default to 600 seconds.
    pub fn set_keep_alive_idle(mut self, dur: Duration) -> Self {
        self.config.keep_alive_idle = dur;
        self
    }

    /// Set duration a connection is kept in pool since it's creation.
    ///
    /// Default to 3600 seconds.
    pub fn set_keep_alive_born(mut self, dur: Duration) -> Self {
        self.config.keep_alive_born = dur;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Finish the builder and construct [Pool] on top of given provider. Number of connections is
    /// bound by [LimitedProvider].
    pub fn finish_pool<P>(self, provider: P) -> Pool<LimitedProvider<P>>
    where
        P: Provider,
    {
        let provider = LimitedProvider::new(provider, self.config.max_connections);
        Pool::new(provider, self.config)
    }

    /// Finish the builder and construct [RequestExecutor] instance.
    pub fn finish<P>(self, provider: P) -> RequestExecutor<LimitedProvider<P>>
    where
        P: Provider,
    {
        RequestExecutor::new(self.finish_pool(provider))
    }
}
