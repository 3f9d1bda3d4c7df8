//! book keeping of one negotiated physical connection.

use core::{
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use std::{collections::HashMap, sync::Arc};

use http::Version;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::error;

use crate::{
    error::Error,
    transport::{Connection, ConnectionId, StreamId},
};

/// metadata of the exchange a stream is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeContext {
    pub execution_id: u64,
    pub protocol: Version,
}

/// handle for failing one stream from outside of the task driving it.
///
/// The first [AbortHandle::abort] call wins and the reason is handed to the waiter of
/// [AbortHandle::aborted].
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    fired: AtomicBool,
    reason: Mutex<Option<Error>>,
    notify: Notify,
}

impl AbortHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                fired: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns false when the stream was already aborted.
    pub fn abort(&self, reason: Error) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if self.inner.fired.load(Ordering::Acquire) {
                return false;
            }
            *slot = Some(reason);
            self.inner.fired.store(true, Ordering::Release);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// resolve to the abort reason once [AbortHandle::abort] is called.
    pub async fn aborted(&self) -> Error {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            if self.is_aborted() {
                // reason can only be observed once. later waiters see a plain cancellation.
                return self.inner.reason.lock().take().unwrap_or(Error::Cancelled);
            }

            notified.await;
        }
    }
}

/// snapshot of one connection inside pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub max_concurrent_streams: usize,
    pub available_streams: usize,
    pub active_streams: usize,
    pub draining: bool,
}

pub(crate) struct ConnectionRecord<C> {
    conn: C,
    max_concurrent_streams: usize,
    state: Mutex<RecordState>,
}

struct RecordState {
    // slots neither reserved nor occupied by an open stream.
    available: usize,
    draining: bool,
    // teardown of the physical connection has been started. it happens at most once.
    closed: bool,
    last_stream_id: Option<StreamId>,
    streams: HashMap<StreamId, StreamEntry>,
    born: Instant,
    idle_since: Instant,
}

struct StreamEntry {
    abort: AbortHandle,
    context: Option<ExchangeContext>,
}

/// output of [ConnectionRecord::drain].
pub(crate) struct Drain {
    /// streams remote peer would never process.
    pub(crate) refused: Vec<(StreamId, AbortHandle)>,
    /// record is empty and it's connection must be torn down by caller.
    pub(crate) teardown: bool,
}

impl<C> ConnectionRecord<C>
where
    C: Connection,
{
    pub(crate) fn new(conn: C, max_concurrent_streams: usize) -> Self {
        let now = Instant::now();
        Self {
            conn,
            max_concurrent_streams,
            state: Mutex::new(RecordState {
                available: max_concurrent_streams,
                draining: false,
                closed: false,
                last_stream_id: None,
                streams: HashMap::new(),
                born: now,
                idle_since: now,
            }),
        }
    }

    pub(crate) fn conn(&self) -> &C {
        &self.conn
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// number of streams that can still be opened. always 0 for a draining record.
    pub(crate) fn available_streams(&self) -> usize {
        let state = self.state.lock();
        if state.draining { 0 } else { state.available }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// reserve one stream slot. Returns false when record can not take more streams.
    pub(crate) fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if state.draining || state.closed || state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// give back a slot reserved by [ConnectionRecord::try_reserve] that never got a stream.
    /// Returns true when caller must tear down the connection.
    pub(crate) fn cancel_reservation(&self) -> bool {
        let mut state = self.state.lock();
        self.put_back(&mut state);
        self.try_start_teardown(&mut state)
    }

    /// turn a reserved slot into an active stream. Returns None when the record went draining or
    /// closed after the reservation and the stream must not be used.
    pub(crate) fn register(&self, id: StreamId) -> Option<AbortHandle> {
        let mut state = self.state.lock();
        if state.draining || state.closed {
            return None;
        }

        let abort = AbortHandle::new();
        let entry = StreamEntry {
            abort: abort.clone(),
            context: None,
        };

        if state.streams.insert(id, entry).is_some() {
            error!("connection {} reused stream id {id}", self.conn.id());
        }

        Some(abort)
    }

    pub(crate) fn attach(&self, id: StreamId, ctx: ExchangeContext) -> Result<(), Error> {
        let mut state = self.state.lock();
        let entry = state.streams.get_mut(&id).ok_or(Error::NotAMemberStream(id))?;
        entry.context = Some(ctx);
        Ok(())
    }

    pub(crate) fn context(&self, id: StreamId) -> Option<ExchangeContext> {
        self.state.lock().streams.get(&id).and_then(|entry| entry.context)
    }

    /// remove stream from record and free it's slot.
    /// Returns true when caller must tear down the connection.
    pub(crate) fn release(&self, id: StreamId) -> Result<bool, Error> {
        let mut state = self.state.lock();
        state.streams.remove(&id).ok_or(Error::NotAMemberStream(id))?;

        self.put_back(&mut state);

        if state.streams.is_empty() {
            state.idle_since = Instant::now();
        }

        Ok(self.try_start_teardown(&mut state))
    }

    /// stop handing out streams. when `last_stream_id` is given every stream above it is
    /// reported as refused.
    pub(crate) fn drain(&self, last_stream_id: Option<StreamId>) -> Drain {
        let mut state = self.state.lock();
        state.draining = true;

        let mut refused = Vec::new();

        if let Some(last) = last_stream_id {
            let last = state.last_stream_id.map_or(last, |prev| prev.min(last));
            state.last_stream_id = Some(last);

            refused.extend(
                state
                    .streams
                    .iter()
                    .filter(|(id, _)| **id > last)
                    .map(|(id, entry)| (*id, entry.abort.clone())),
            );
            refused.sort_by_key(|(id, _)| *id);
        }

        let teardown = self.try_start_teardown(&mut state);

        Drain { refused, teardown }
    }

    /// mark record as closed regardless of it's active streams. Returns the abort handles of
    /// every active stream and if teardown was not started already.
    pub(crate) fn close(&self) -> (Vec<AbortHandle>, bool) {
        let mut state = self.state.lock();
        state.draining = true;
        let aborts = state.streams.values().map(|entry| entry.abort.clone()).collect();
        let teardown = !state.closed;
        state.closed = true;
        (aborts, teardown)
    }

    /// abort handles of every active stream.
    pub(crate) fn abort_handles(&self) -> Vec<AbortHandle> {
        let state = self.state.lock();
        state.streams.values().map(|entry| entry.abort.clone()).collect()
    }

    /// check keep alive. an expired record without streams starts teardown and Returns true.
    /// an expired record with active streams is switched to draining.
    pub(crate) fn expire(&self, idle: Duration, born: Duration) -> bool {
        let mut state = self.state.lock();
        if state.draining || state.closed {
            return false;
        }

        let is_idle = state.streams.is_empty() && state.idle_since.elapsed() > idle;
        if !is_idle && state.born.elapsed() <= born {
            return false;
        }

        state.draining = true;
        self.try_start_teardown(&mut state)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        let state = self.state.lock();
        ConnectionStats {
            id: self.conn.id(),
            max_concurrent_streams: self.max_concurrent_streams,
            available_streams: if state.draining { 0 } else { state.available },
            active_streams: state.streams.len(),
            draining: state.draining,
        }
    }

    fn put_back(&self, state: &mut RecordState) {
        debug_assert!(
            state.available < self.max_concurrent_streams,
            "stream slot given back to a connection without any slot taken"
        );
        state.available = (state.available + 1).min(self.max_concurrent_streams);
    }

    // a draining record with every slot free has nothing left to do.
    fn try_start_teardown(&self, state: &mut RecordState) -> bool {
        if state.draining && !state.closed && state.available == self.max_concurrent_streams {
            state.closed = true;
            return true;
        }
        false
    }
}
