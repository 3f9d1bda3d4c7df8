//! traits for physical connections and the logical streams multiplexed on top of them.
//!
//! Connection establishment, tls handshake and protocol framing live outside of this crate.
//! A type implementing [Provider] hands out negotiated [Connection]s and a [Connection] opens
//! [Stream]s where one request/response exchange happens.

use core::{fmt, future::Future};

use bytes::Bytes;
use http::{HeaderMap, Request, Response};

use crate::error::Error;

/// identifier of a logical stream. it grows monotonically for the lifetime of a physical
/// connection, the same way http/2 stream ids do.
pub type StreamId = u32;

/// identifier of a physical connection. must be unique among connections of one [Provider].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// outcome of protocol negotiation of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// one exchange at a time. http/1 for example.
    Single,
    /// concurrent streams up to the capacity remote peer advertised.
    Multiplexed { max_concurrent_streams: usize },
}

/// connection level event observed by [Connection::signal].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// remote peer would not accept streams with id greater than the given one.
    GracefulShutdown(StreamId),
    /// connection is gone.
    Closed,
}

/// unit of response data read from a [RecvStream].
#[derive(Debug)]
pub enum Frame {
    Head(Response<()>),
    Data(Bytes),
    Trailers(HeaderMap),
}

/// source of physical connections.
pub trait Provider: Send + Sync + 'static {
    type Connection: Connection;

    /// establish or reuse a physical connection.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, Error>> + Send;

    /// hand a connection back. called exactly once for every connection [Provider::acquire]
    /// produced, right before the connection is closed.
    fn release(&self, conn: &Self::Connection);

    /// close provider and everything it still owns.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// handle of one physical connection. cloning a handle must not clone the connection itself.
pub trait Connection: Clone + Send + Sync + 'static {
    type Stream: Stream;

    fn id(&self) -> ConnectionId;

    /// resolve to the negotiated protocol once handshake is finished.
    fn negotiate(&self) -> impl Future<Output = Result<Negotiation, Error>> + Send;

    /// open a new logical stream. only called on multiplexed connections.
    fn open_stream(&self) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// resolve when remote peer initiates a graceful shutdown or when connection is closed.
    ///
    /// Once a graceful shutdown has been reported, the next call must only resolve when the
    /// connection is closed.
    fn signal(&self) -> impl Future<Output = Signal> + Send;

    fn is_active(&self) -> bool;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// one logical request/response exchange multiplexed on a [Connection].
pub trait Stream: Send + 'static {
    type Tx: SendStream;
    type Rx: RecvStream;

    fn id(&self) -> StreamId;

    fn is_active(&self) -> bool;

    /// when set to false the transport must not buffer response data beyond what
    /// [RecvStream::read] asked for.
    fn set_auto_read(&mut self, auto_read: bool);

    /// split into sending and receiving half so both can make progress at the same time.
    fn split(&mut self) -> (&mut Self::Tx, &mut Self::Rx);

    /// abort stream on transport level.
    fn close(&mut self);
}

pub trait SendStream: Send {
    fn send_head(&mut self, head: Request<()>, end_of_stream: bool) -> impl Future<Output = Result<(), Error>> + Send;

    /// send data and wait for transport to accept it.
    fn send_data(&mut self, data: Bytes, end_of_stream: bool) -> impl Future<Output = Result<(), Error>> + Send;
}

pub trait RecvStream: Send {
    /// read the next frame of response. `None` means the response is finished.
    ///
    /// Must be cancel safe. A read dropped before resolving must not lose any frame.
    fn read(&mut self) -> impl Future<Output = Result<Option<Frame>, Error>> + Send;
}
