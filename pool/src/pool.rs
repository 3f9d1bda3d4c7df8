//! connection pool multiplexing logical streams over negotiated physical connections.

use core::{
    fmt, mem,
    ops::{Deref, DerefMut},
    pin::pin,
};

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    select,
    sync::Notify,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, trace, warn};

use crate::{
    config::Config,
    error::{Error, GoAwayError},
    record::{AbortHandle, ConnectionRecord, ConnectionStats, ExchangeContext},
    transport::{Connection, ConnectionId, Negotiation, Provider, Signal, Stream, StreamId},
};

type Record<P> = ConnectionRecord<<P as Provider>::Connection>;
type StreamOf<P> = <<P as Provider>::Connection as Connection>::Stream;

/// Pool of multiplexed physical connections.
///
/// Streams are handed out first fit: the earliest created connection with spare capacity is
/// always preferred. A new physical connection is only requested from [Provider] when every
/// tracked connection is full or draining.
pub struct Pool<P>
where
    P: Provider,
{
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Pool<P>
where
    P: Provider,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<P>
where
    P: Provider,
{
    provider: P,
    config: Config,
    // notified every time a stream slot becomes free.
    released: Notify,
    state: Mutex<State<P::Connection>>,
}

struct State<C> {
    closed: bool,
    records: Vec<Arc<ConnectionRecord<C>>>,
    // connections acquired from provider and still negotiating protocol.
    negotiating: HashMap<ConnectionId, C>,
    watchers: HashMap<ConnectionId, JoinHandle<()>>,
    teardowns: JoinSet<()>,
}

/// snapshot of pool state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub closed: bool,
    pub negotiating: usize,
    pub connections: Vec<ConnectionStats>,
}

impl<P> Pool<P>
where
    P: Provider,
{
    pub fn new(provider: P, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                released: Notify::new(),
                state: Mutex::new(State {
                    closed: false,
                    records: Vec::new(),
                    negotiating: HashMap::new(),
                    watchers: HashMap::new(),
                    teardowns: JoinSet::new(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    /// acquire a stream from pool.
    pub async fn acquire(&self) -> Result<PooledStream<P>, Error> {
        // in flight connection attempt. it survives rescans of the pool so a slow connect is not
        // started over every time a stream slot is freed.
        let mut connecting = None;

        loop {
            // registered before scanning so a slot freed after the scan is not missed.
            let mut released = pin!(self.shared.released.notified());
            released.as_mut().enable();

            let reserved = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                self.reap_expired(&mut state);
                state.records.iter().find(|record| record.try_reserve()).cloned()
            };

            if let Some(record) = reserved {
                match self.open(record, false).await? {
                    Some(stream) => return Ok(stream),
                    None => continue,
                }
            }

            let connect = connecting.get_or_insert_with(|| Box::pin(self.shared.provider.acquire()));

            let res = select! {
                biased;
                res = connect.as_mut() => res,
                _ = released => {
                    trace!("stream slot freed while acquiring connection. scanning pool again");
                    continue;
                }
            };

            connecting = None;
            let conn = res?;

            if let Some(record) = self.negotiate(conn).await? {
                if let Some(stream) = self.open(record, true).await? {
                    return Ok(stream);
                }
            }
        }
    }

    /// return a stream to pool.
    ///
    /// A draining connection without any remaining stream is torn down.
    pub fn release(&self, mut stream: PooledStream<P>) -> Result<(), Error> {
        stream.released = true;

        let record = stream.record.clone();

        if !Arc::ptr_eq(&self.shared, &stream.pool.shared) {
            error!(
                "stream {} of connection {} is released into a pool that did not create it",
                stream.stream.id(),
                record.id()
            );
            stream.stream.close();
            // bookkeeping still belongs to the owning pool.
            let owner = stream.pool.clone();
            if let Err(e) = owner.release_stream(&mut stream.stream, &record) {
                warn!("failed to return foreign stream to it's own pool: {e}");
            }
            return Err(Error::UnknownConnection(record.id()));
        }

        self.release_stream(&mut stream.stream, &record)
    }

    /// handle graceful shutdown of connection initiated by remote peer.
    ///
    /// The connection takes no new stream and every active stream above `last_stream_id` is failed
    /// with a retryable [Error::GoAway].
    pub fn handle_graceful_shutdown(&self, conn: &P::Connection, last_stream_id: StreamId) {
        let id = conn.id();
        let mut state = self.shared.state.lock();

        if let Some(record) = find(&state.records, id) {
            let drain = record.drain(Some(last_stream_id));
            if drain.teardown {
                self.teardown(&mut state, &record);
            }
            drop(state);

            debug!(
                "connection {id} is shutting down gracefully. last stream: {last_stream_id}. refused streams: {}",
                drain.refused.len()
            );

            for (stream_id, abort) in drain.refused {
                abort.abort(Error::GoAway(GoAwayError {
                    stream_id,
                    last_stream_id,
                }));
            }
        } else if let Some(conn) = state.negotiating.remove(&id) {
            debug!("connection {id} is shutting down before negotiation finished");
            self.teardown_conn(&mut state, conn);
        } else {
            drop(state);
            debug!("connection {id} is not tracked by pool. closing it");
            let conn = conn.clone();
            spawn_detached(id, async move { conn.close().await });
        }
    }

    /// close pool. every connection is torn down and outstanding streams are failed.
    ///
    /// Waiting for teardown and provider closing is bounded by shutdown timeout.
    pub async fn close(&self) -> Result<(), Error> {
        let (aborts, mut teardowns) = {
            let mut state = self.shared.state.lock();
            state.closed = true;

            let mut aborts = Vec::new();

            for record in mem::take(&mut state.records) {
                let (streams, teardown) = record.close();
                aborts.extend(streams);
                if teardown {
                    self.teardown_conn(&mut state, record.conn().clone());
                }
            }

            for (_, conn) in mem::take(&mut state.negotiating) {
                self.teardown_conn(&mut state, conn);
            }

            for (_, watcher) in state.watchers.drain() {
                watcher.abort();
            }

            (aborts, mem::take(&mut state.teardowns))
        };

        debug!("closing pool. failing {} outstanding streams", aborts.len());

        for abort in aborts {
            abort.abort(Error::PoolClosed);
        }

        // wake up acquires waiting on provider.
        self.shared.released.notify_waiters();

        let dur = self.shared.config.timeout.shutdown_timeout;

        let shutdown = async {
            while let Some(res) = teardowns.join_next().await {
                if let Err(e) = res {
                    warn!("connection teardown failed: {e}");
                }
            }
            self.shared.provider.close().await;
        };

        tokio::time::timeout(dur, shutdown)
            .await
            .map_err(|_| Error::ShutdownTimeout(dur))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            closed: state.closed,
            negotiating: state.negotiating.len(),
            connections: state.records.iter().map(|record| record.stats()).collect(),
        }
    }

    // open a stream on a record with one slot already reserved. Returns None when the stream
    // must be acquired again from the beginning.
    async fn open(&self, record: Arc<Record<P>>, fresh: bool) -> Result<Option<PooledStream<P>>, Error> {
        let mut reservation = Reservation {
            pool: self,
            record: Some(record.clone()),
        };

        let res = record.conn().open_stream().await;

        reservation.record = None;

        match res {
            Ok(mut stream) => {
                let id = stream.id();
                match record.register(id) {
                    Some(abort) => {
                        trace!("stream {id} opened on connection {}", record.id());
                        Ok(Some(PooledStream {
                            stream,
                            record,
                            pool: self.clone(),
                            abort,
                            released: false,
                        }))
                    }
                    None => {
                        debug!("connection {} went draining. stream {id} is refused", record.id());
                        stream.close();
                        self.cancel_reservation(&record);
                        Ok(None)
                    }
                }
            }
            Err(e) => {
                let dead = !record.conn().is_active();
                if dead {
                    debug!("connection {} is gone: {e}", record.id());
                    self.drain(&record);
                }

                let retry = !fresh && (dead || record.is_draining());
                self.cancel_reservation(&record);

                if retry { Ok(None) } else { Err(e) }
            }
        }
    }

    // negotiate protocol of new connection and add it to pool. the returned record has one slot
    // reserved for caller. Returns None when connection is gone during negotiation and acquire
    // should be tried again.
    async fn negotiate(&self, conn: P::Connection) -> Result<Option<Arc<Record<P>>>, Error> {
        let id = conn.id();

        {
            let mut state = self.shared.state.lock();
            if state.closed {
                debug!("pool closed while acquiring connection {id}");
                self.teardown_conn(&mut state, conn);
                return Err(Error::PoolClosed);
            }
            state.negotiating.insert(id, conn.clone());
            self.spawn_watcher(&mut state, conn.clone());
        }

        let mut guard = Negotiating {
            pool: self,
            id,
            armed: true,
        };

        let res = conn.negotiate().await;

        guard.armed = false;

        let mut state = self.shared.state.lock();

        let Some(conn) = state.negotiating.remove(&id) else {
            // torn down by pool close or shutdown signal while negotiating.
            return if state.closed {
                Err(Error::PoolClosed)
            } else {
                Ok(None)
            };
        };

        match res {
            Ok(Negotiation::Multiplexed { max_concurrent_streams }) if max_concurrent_streams > 0 => {
                debug!("connection {id} negotiated with {max_concurrent_streams} concurrent streams");
                let record = Arc::new(ConnectionRecord::new(conn, max_concurrent_streams));
                let reserved = record.try_reserve();
                debug_assert!(reserved, "fresh connection must have a free slot");
                state.records.push(record.clone());
                Ok(Some(record))
            }
            Ok(negotiation) => {
                debug!("connection {id} negotiated {negotiation:?}. stream multiplexing is not possible");
                self.teardown_conn(&mut state, conn);
                Err(Error::NegotiationProtocolMismatch)
            }
            Err(e) => {
                debug!("connection {id} failed negotiation: {e}");
                self.teardown_conn(&mut state, conn);
                Err(e)
            }
        }
    }

    fn release_stream(&self, stream: &mut StreamOf<P>, record: &Arc<Record<P>>) -> Result<(), Error> {
        let id = stream.id();
        let mut state = self.shared.state.lock();

        let tracked = state.records.iter().any(|r| Arc::ptr_eq(r, record));
        if !tracked && !state.closed {
            drop(state);
            stream.close();
            return Err(Error::UnknownConnection(record.id()));
        }

        match record.release(id) {
            Ok(teardown) => {
                if teardown && tracked {
                    debug!("last stream of draining connection {} released", record.id());
                    self.teardown(&mut state, record);
                }
                drop(state);
                trace!("stream {id} released to connection {}", record.id());
                self.notify_released(record);
                Ok(())
            }
            Err(e) => {
                drop(state);
                stream.close();
                Err(e)
            }
        }
    }

    fn cancel_reservation(&self, record: &Arc<Record<P>>) {
        if record.cancel_reservation() {
            let mut state = self.shared.state.lock();
            self.teardown(&mut state, record);
        }
        self.notify_released(record);
    }

    // wake one waiting acquire. slots freed on a draining or closed record can not be handed out
    // and waking for them would only interrupt connection attempts.
    fn notify_released(&self, record: &Record<P>) {
        if record.available_streams() > 0 {
            self.shared.released.notify_one();
        }
    }

    fn drain(&self, record: &Arc<Record<P>>) {
        if record.drain(None).teardown {
            let mut state = self.shared.state.lock();
            self.teardown(&mut state, record);
        }
    }

    fn on_signal(&self, conn: &P::Connection, signal: Signal) {
        match signal {
            Signal::GracefulShutdown(last_stream_id) => self.handle_graceful_shutdown(conn, last_stream_id),
            Signal::Closed => {
                let id = conn.id();
                let mut state = self.shared.state.lock();

                if let Some(record) = find(&state.records, id) {
                    if record.drain(None).teardown {
                        self.teardown(&mut state, &record);
                    }
                    drop(state);

                    let aborts = record.abort_handles();
                    debug!("connection {id} closed. failing {} active streams", aborts.len());
                    for abort in aborts {
                        abort.abort(Error::PrematureChannelClose);
                    }
                } else if let Some(conn) = state.negotiating.remove(&id) {
                    debug!("connection {id} closed before negotiation finished");
                    self.teardown_conn(&mut state, conn);
                }
            }
        }
    }

    fn reap_expired(&self, state: &mut State<P::Connection>) {
        let Config {
            keep_alive_idle,
            keep_alive_born,
            ..
        } = self.shared.config;

        let expired = state
            .records
            .iter()
            .filter(|record| record.expire(keep_alive_idle, keep_alive_born))
            .cloned()
            .collect::<Vec<_>>();

        for record in expired {
            debug!("connection {} expired", record.id());
            self.teardown(state, &record);
        }
    }

    fn teardown(&self, state: &mut State<P::Connection>, record: &Arc<Record<P>>) {
        state.records.retain(|r| !Arc::ptr_eq(r, record));
        self.teardown_conn(state, record.conn().clone());
    }

    // hand connection back to provider and close it. closing happens in background and is awaited
    // by pool close.
    fn teardown_conn(&self, state: &mut State<P::Connection>, conn: P::Connection) {
        let id = conn.id();

        if let Some(watcher) = state.watchers.remove(&id) {
            watcher.abort();
        }

        self.shared.provider.release(&conn);

        match Handle::try_current() {
            Ok(handle) => {
                // reap finished teardowns.
                while state.teardowns.try_join_next().is_some() {}
                state.teardowns.spawn_on(async move { conn.close().await }, &handle);
                debug!("connection {id} is torn down");
            }
            Err(_) => warn!("connection {id} is dropped without closing. no async runtime is running"),
        }
    }

    fn spawn_watcher(&self, state: &mut State<P::Connection>, conn: P::Connection) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let id = conn.id();
        let pool = Arc::downgrade(&self.shared);

        let watcher = handle.spawn(watch(pool, conn));

        if let Some(prev) = state.watchers.insert(id, watcher) {
            error!("connection {id} is watched more than once. connection id must be unique");
            prev.abort();
        }
    }
}

// connection loop. observe connection level signals and feed them back to pool until the
// connection is closed. streams surviving a graceful shutdown still need to be failed on close.
async fn watch<P>(pool: Weak<Shared<P>>, conn: P::Connection)
where
    P: Provider,
{
    loop {
        let signal = conn.signal().await;
        trace!("connection {} signaled {signal:?}", conn.id());

        let Some(shared) = pool.upgrade() else {
            return;
        };

        Pool { shared }.on_signal(&conn, signal);

        if matches!(signal, Signal::Closed) {
            return;
        }
    }
}

fn find<C>(records: &[Arc<ConnectionRecord<C>>], id: ConnectionId) -> Option<Arc<ConnectionRecord<C>>>
where
    C: Connection,
{
    records.iter().find(|record| record.id() == id).cloned()
}

fn spawn_detached<F>(id: ConnectionId, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => drop(handle.spawn(fut)),
        Err(_) => warn!("connection {id} is dropped without closing. no async runtime is running"),
    }
}

// slot reserved on a record. given back when stream opening is cancelled.
struct Reservation<'a, P>
where
    P: Provider,
{
    pool: &'a Pool<P>,
    record: Option<Arc<Record<P>>>,
}

impl<P> Drop for Reservation<'_, P>
where
    P: Provider,
{
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            trace!("stream opening on connection {} is cancelled", record.id());
            self.pool.cancel_reservation(&record);
        }
    }
}

// connection acquired from provider but not added to pool yet. torn down when negotiation is
// cancelled.
struct Negotiating<'a, P>
where
    P: Provider,
{
    pool: &'a Pool<P>,
    id: ConnectionId,
    armed: bool,
}

impl<P> Drop for Negotiating<'_, P>
where
    P: Provider,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.pool.shared.state.lock();
        if let Some(conn) = state.negotiating.remove(&self.id) {
            trace!("negotiation of connection {} is cancelled", self.id);
            self.pool.teardown_conn(&mut state, conn);
        }
    }
}

/// A logical stream checked out from [Pool].
///
/// Dropping it without calling [Pool::release] closes the stream on transport and returns it's
/// slot to the connection.
pub struct PooledStream<P>
where
    P: Provider,
{
    stream: StreamOf<P>,
    record: Arc<Record<P>>,
    pool: Pool<P>,
    abort: AbortHandle,
    released: bool,
}

impl<P> PooledStream<P>
where
    P: Provider,
{
    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.record.id()
    }

    /// attach exchange metadata to stream inside it's connection record.
    pub fn attach(&self, ctx: ExchangeContext) -> Result<(), Error> {
        self.record.attach(self.stream.id(), ctx)
    }

    pub fn context(&self) -> Option<ExchangeContext> {
        self.record.context(self.stream.id())
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// resolve when pool fails this stream. see [AbortHandle::aborted].
    pub async fn aborted(&self) -> Error {
        self.abort.aborted().await
    }
}

impl<P> fmt::Debug for PooledStream<P>
where
    P: Provider,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStream")
            .field("connection", &self.record.id())
            .field("stream", &self.stream.id())
            .finish()
    }
}

impl<P> Deref for PooledStream<P>
where
    P: Provider,
{
    type Target = StreamOf<P>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

impl<P> DerefMut for PooledStream<P>
where
    P: Provider,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.stream
    }
}

impl<P> Drop for PooledStream<P>
where
    P: Provider,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.released = true;
        self.stream.close();

        let record = self.record.clone();
        if let Err(e) = self.pool.release_stream(&mut self.stream, &record) {
            warn!("failed to release dropped stream: {e}");
        }
    }
}
