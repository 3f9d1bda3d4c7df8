//! admission policies layered on top of [Pool].

use core::{
    pin::pin,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::sleep,
};
use tracing::{trace, warn};

use crate::{
    config::Config,
    error::{Error, TimeoutError},
    pool::{Pool, PooledStream},
    timeout::Timeout,
    transport::{Connection, ConnectionId, Provider},
};

/// [Provider] wrapper bounding the number of physical connections open at the same time.
///
/// One permit is held for every connection handed out and returned when the connection is
/// released. Closing it fails every waiting acquire with [Error::PoolClosed].
pub struct LimitedProvider<P>
where
    P: Provider,
{
    provider: P,
    permits: Arc<Semaphore>,
    held: Mutex<HashMap<ConnectionId, OwnedSemaphorePermit>>,
}

impl<P> LimitedProvider<P>
where
    P: Provider,
{
    /// # Panics:
    /// When pass 0 as max connections.
    pub fn new(provider: P, max_connections: usize) -> Self {
        assert_ne!(max_connections, 0, "max connections must be greater than 0");
        Self {
            provider,
            permits: Arc::new(Semaphore::new(max_connections)),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.provider
    }

    /// number of connections that can still be opened.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<P> Provider for LimitedProvider<P>
where
    P: Provider,
{
    type Connection = P::Connection;

    async fn acquire(&self) -> Result<Self::Connection, Error> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        let conn = self.provider.acquire().await?;

        if self.held.lock().insert(conn.id(), permit).is_some() {
            warn!("connection {} is handed out twice by provider", conn.id());
        }

        Ok(conn)
    }

    fn release(&self, conn: &Self::Connection) {
        self.provider.release(conn);
        if self.held.lock().remove(&conn.id()).is_none() {
            warn!("connection {} released without holding a permit", conn.id());
        }
    }

    async fn close(&self) {
        self.permits.close();
        self.held.lock().clear();
        self.provider.close().await;
    }
}

/// bound on acquires waiting for a stream at the same time and on the time each of them waits.
///
/// Errors are raw [Error::QueueFull] and [Error::Timeout] and get their final shape from
/// [ExecutionOutcome](crate::ExecutionOutcome).
pub struct AcquireQueue {
    pending: AtomicUsize,
    max_pending: usize,
    timeout: Duration,
}

impl AcquireQueue {
    pub const fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            max_pending,
            timeout,
        }
    }

    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.max_pending_acquires, config.timeout.acquire_timeout)
    }

    /// number of acquires currently waiting.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub async fn acquire<P>(&self, pool: &Pool<P>) -> Result<PooledStream<P>, Error>
    where
        P: Provider,
    {
        let _guard = self.enter()?;

        let timer = pin!(sleep(self.timeout));

        pool.acquire().timeout(timer).await.map_err(|_| {
            trace!("acquiring stream timed out after {:?}", self.timeout);
            Error::Timeout(TimeoutError::Acquire)
        })?
    }

    fn enter(&self) -> Result<PendingGuard<'_>, Error> {
        let prev = self.pending.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::QueueFull(self.max_pending));
        }
        Ok(PendingGuard(&self.pending))
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
