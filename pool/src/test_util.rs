//! in memory transport for exercising pool and executor.

use core::{
    future::pending,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use std::{collections::VecDeque, io, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode, Version};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use crate::{
    error::Error,
    transport::{
        Connection, ConnectionId, Frame, Negotiation, Provider, RecvStream, SendStream, Signal, Stream, StreamId,
    },
};

/// scripted step of a mocked response.
#[derive(Clone, Debug)]
pub(crate) enum MockFrame {
    Head(StatusCode),
    Data(&'static str),
    Trailers,
    Error(io::ErrorKind),
    /// wait before moving to next step.
    Delay(Duration),
    /// never resolve.
    Pending,
}

/// head of a request observed by transport.
#[derive(Clone, Debug)]
pub(crate) struct SentHead {
    pub(crate) stream_id: StreamId,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) end_of_stream: bool,
}

struct Shared {
    negotiation: Mutex<Negotiation>,
    negotiate_gate: Mutex<Option<Arc<Notify>>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    hang_close: AtomicBool,
    events: Mutex<Vec<String>>,
    acquired: Mutex<Vec<MockConnection>>,
    script: Mutex<Vec<MockFrame>>,
    stall_writes: AtomicBool,
    heads: Mutex<Vec<SentHead>>,
    data: Mutex<Vec<(StreamId, Bytes, bool)>>,
}

#[derive(Clone)]
pub(crate) struct MockProvider {
    shared: Arc<Shared>,
}

impl MockProvider {
    pub(crate) fn multiplexed(max_concurrent_streams: usize) -> Self {
        Self::new(Negotiation::Multiplexed { max_concurrent_streams })
    }

    pub(crate) fn new(negotiation: Negotiation) -> Self {
        Self {
            shared: Arc::new(Shared {
                negotiation: Mutex::new(negotiation),
                negotiate_gate: Mutex::new(None),
                next_id: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(None),
                hang_close: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
                acquired: Mutex::new(Vec::new()),
                script: Mutex::new(vec![MockFrame::Head(StatusCode::OK), MockFrame::Data("hello")]),
                stall_writes: AtomicBool::new(false),
                heads: Mutex::new(Vec::new()),
                data: Mutex::new(Vec::new()),
            }),
        }
    }

    /// construct a connection sharing the event log of this provider.
    pub(crate) fn connection(&self, id: u64) -> MockConnection {
        let (signal, _) = watch::channel(None);
        MockConnection {
            inner: Arc::new(ConnInner {
                id: ConnectionId::new(id),
                shared: self.shared.clone(),
                active: AtomicBool::new(true),
                next_stream: AtomicU32::new(1),
                shutdown_reported: AtomicBool::new(false),
                signal,
            }),
        }
    }

    /// hold negotiation of every connection until [MockProvider::open_gate] is called.
    pub(crate) fn gate_negotiation(&self) {
        *self.shared.negotiate_gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub(crate) fn open_gate(&self) {
        if let Some(gate) = self.shared.negotiate_gate.lock().take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub(crate) fn set_negotiation(&self, negotiation: Negotiation) {
        *self.shared.negotiation.lock() = negotiation;
    }

    pub(crate) fn set_script(&self, script: impl IntoIterator<Item = MockFrame>) {
        *self.shared.script.lock() = script.into_iter().collect();
    }

    /// every connection attempt takes the given time before resolving.
    pub(crate) fn set_connect_delay(&self, dur: Duration) {
        *self.shared.connect_delay.lock() = Some(dur);
    }

    /// provider close never resolves.
    pub(crate) fn hang_close(&self) {
        self.shared.hang_close.store(true, Ordering::SeqCst);
    }

    /// number of times [Provider::acquire] has been called, including attempts dropped before
    /// resolving.
    pub(crate) fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn stall_writes(&self) {
        self.shared.stall_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.shared.events.lock().clone()
    }

    pub(crate) fn acquired(&self) -> Vec<MockConnection> {
        self.shared.acquired.lock().clone()
    }

    pub(crate) fn heads(&self) -> Vec<SentHead> {
        self.shared.heads.lock().clone()
    }

    /// data chunks written to transport paired with their stream id and end of stream flag.
    pub(crate) fn data(&self) -> Vec<(StreamId, Bytes, bool)> {
        self.shared.data.lock().clone()
    }

    fn event(&self, event: String) {
        self.shared.events.lock().push(event);
    }
}

impl Provider for MockProvider {
    type Connection = MockConnection;

    async fn acquire(&self) -> Result<Self::Connection, Error> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shared.connect_delay.lock();
        if let Some(dur) = delay {
            tokio::time::sleep(dur).await;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = self.connection(id);
        self.event(format!("acquire:{id}"));
        self.shared.acquired.lock().push(conn.clone());
        Ok(conn)
    }

    fn release(&self, conn: &Self::Connection) {
        self.event(format!("release:{}", conn.id()));
    }

    async fn close(&self) {
        if self.shared.hang_close.load(Ordering::SeqCst) {
            pending::<()>().await;
        }
        self.event("provider-close".to_owned());
    }
}

struct ConnInner {
    id: ConnectionId,
    shared: Arc<Shared>,
    active: AtomicBool,
    next_stream: AtomicU32,
    // graceful shutdown has been handed to a watcher. later calls only wait for close.
    shutdown_reported: AtomicBool,
    signal: watch::Sender<Option<Signal>>,
}

#[derive(Clone)]
pub(crate) struct MockConnection {
    inner: Arc<ConnInner>,
}

impl MockConnection {
    /// remote peer starts graceful shutdown.
    pub(crate) fn goaway(&self, last_stream_id: StreamId) {
        self.inner.signal.send_replace(Some(Signal::GracefulShutdown(last_stream_id)));
    }

    /// remote peer closes connection.
    pub(crate) fn hang_up(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.signal.send_replace(Some(Signal::Closed));
    }

    fn event(&self, event: String) {
        self.inner.shared.events.lock().push(event);
    }
}

impl Connection for MockConnection {
    type Stream = MockStream;

    fn id(&self) -> ConnectionId {
        self.inner.id
    }

    async fn negotiate(&self) -> Result<Negotiation, Error> {
        let gate = self.inner.shared.negotiate_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(*self.inner.shared.negotiation.lock())
    }

    async fn open_stream(&self) -> Result<Self::Stream, Error> {
        if !self.is_active() {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }

        let id = self.inner.next_stream.fetch_add(2, Ordering::SeqCst);
        let script = self.inner.shared.script.lock().iter().cloned().collect();

        Ok(MockStream {
            id,
            conn: self.clone(),
            closed: false,
            tx: MockTx {
                id,
                shared: self.inner.shared.clone(),
            },
            rx: MockRx { script },
        })
    }

    async fn signal(&self) -> Signal {
        let reported = self.inner.shutdown_reported.load(Ordering::SeqCst);
        let mut rx = self.inner.signal.subscribe();

        let signal = match rx
            .wait_for(|signal| match signal {
                Some(Signal::GracefulShutdown(_)) => !reported,
                Some(Signal::Closed) => true,
                None => false,
            })
            .await
        {
            Ok(signal) => signal.unwrap_or(Signal::Closed),
            Err(_) => Signal::Closed,
        };

        if matches!(signal, Signal::GracefulShutdown(_)) {
            self.inner.shutdown_reported.store(true, Ordering::SeqCst);
        }

        signal
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.event(format!("close:{}", self.inner.id));
    }
}

pub(crate) struct MockStream {
    id: StreamId,
    conn: MockConnection,
    closed: bool,
    tx: MockTx,
    rx: MockRx,
}

impl Stream for MockStream {
    type Tx = MockTx;
    type Rx = MockRx;

    fn id(&self) -> StreamId {
        self.id
    }

    fn is_active(&self) -> bool {
        !self.closed && self.conn.is_active()
    }

    fn set_auto_read(&mut self, auto_read: bool) {
        self.conn.event(format!("auto-read:{}:{auto_read}", self.id));
    }

    fn split(&mut self) -> (&mut Self::Tx, &mut Self::Rx) {
        (&mut self.tx, &mut self.rx)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.conn.event(format!("reset:{}", self.id));
        }
    }
}

pub(crate) struct MockTx {
    id: StreamId,
    shared: Arc<Shared>,
}

impl SendStream for MockTx {
    async fn send_head(&mut self, head: Request<()>, end_of_stream: bool) -> Result<(), Error> {
        self.shared.heads.lock().push(SentHead {
            stream_id: self.id,
            version: head.version(),
            headers: head.headers().clone(),
            end_of_stream,
        });
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes, end_of_stream: bool) -> Result<(), Error> {
        if self.shared.stall_writes.load(Ordering::SeqCst) {
            pending::<()>().await;
        }
        self.shared.data.lock().push((self.id, data, end_of_stream));
        Ok(())
    }
}

pub(crate) struct MockRx {
    script: VecDeque<MockFrame>,
}

impl RecvStream for MockRx {
    async fn read(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            let Some(frame) = self.script.pop_front() else {
                return Ok(None);
            };

            let frame = match frame {
                MockFrame::Head(status) => {
                    let mut res = Response::new(());
                    *res.status_mut() = status;
                    *res.version_mut() = Version::HTTP_2;
                    Frame::Head(res)
                }
                MockFrame::Data(data) => Frame::Data(Bytes::from_static(data.as_bytes())),
                MockFrame::Trailers => {
                    let mut trailers = HeaderMap::new();
                    trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
                    Frame::Trailers(trailers)
                }
                MockFrame::Error(kind) => return Err(io::Error::from(kind).into()),
                MockFrame::Delay(dur) => {
                    tokio::time::sleep(dur).await;
                    continue;
                }
                MockFrame::Pending => pending().await,
            };

            return Ok(Some(frame));
        }
    }
}

/// yield to scheduler until condition is met.
pub(crate) async fn until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1024 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition is not met after yielding to scheduler");
}
