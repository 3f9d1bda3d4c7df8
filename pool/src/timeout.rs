use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::time::Sleep;

/// Configuration for timeouts of connection pool and request execution.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Timeout for waiting a stream from pool.
    /// Default to 10 seconds.
    pub(crate) acquire_timeout: Duration,
    /// Timeout for a single write of request head or body chunk.
    /// Default to 30 seconds.
    pub(crate) write_timeout: Duration,
    /// Timeout for a single read of response data.
    /// Default to 30 seconds.
    pub(crate) read_timeout: Duration,
    /// Timeout for waiting interim response of `Expect: 100-continue` request.
    /// Default to 1 second.
    pub(crate) expect_continue_timeout: Duration,
    /// Timeout for closing pool and all it's connections.
    /// Default to 5 seconds.
    pub(crate) shutdown_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutConfig {
    pub const fn new() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            expect_continue_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub const fn acquire_timeout(mut self, dur: Duration) -> Self {
        self.acquire_timeout = dur;
        self
    }

    pub const fn write_timeout(mut self, dur: Duration) -> Self {
        self.write_timeout = dur;
        self
    }

    pub const fn read_timeout(mut self, dur: Duration) -> Self {
        self.read_timeout = dur;
        self
    }

    pub const fn expect_continue_timeout(mut self, dur: Duration) -> Self {
        self.expect_continue_timeout = dur;
        self
    }

    pub const fn shutdown_timeout(mut self, dur: Duration) -> Self {
        self.shutdown_timeout = dur;
        self
    }
}

pub(crate) trait Timeout: Sized {
    /// race self with timer. the timer is borrowed so it can be reset and reused by caller.
    fn timeout(self, timer: Pin<&mut Sleep>) -> TimeoutFuture<'_, Self>;
}

impl<F> Timeout for F
where
    F: Future,
{
    fn timeout(self, timer: Pin<&mut Sleep>) -> TimeoutFuture<'_, Self> {
        TimeoutFuture { fut: self, timer }
    }
}

pin_project! {
    pub(crate) struct TimeoutFuture<'a, F> {
        #[pin]
        fut: F,
        timer: Pin<&'a mut Sleep>,
    }
}

impl<F: Future> Future for TimeoutFuture<'_, F> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(res) = this.fut.poll(cx) {
            return Poll::Ready(Ok(res));
        }

        this.timer.as_mut().poll(cx).map(Err)
    }
}
