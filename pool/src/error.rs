//! strongly typed library error.

use core::{fmt, time::Duration};

use std::{error, io};

use crate::transport::{ConnectionId, StreamId};

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Io(io::Error),
    Std(Box<dyn error::Error + Send + Sync>),
    /// raw timeout observed at one of the timer sites. see [TimeoutError].
    Timeout(TimeoutError),
    /// raw queue overflow. carries the queue size that was exceeded.
    QueueFull(usize),
    /// pool is closed and can not hand out streams anymore.
    PoolClosed,
    /// waiting for a stream took longer than the configured acquire timeout.
    ConnectionAcquireTimeout,
    /// too many acquire requests were waiting. carries the queue size.
    AcquireQueueOverflow(usize),
    /// no response data arrived within the read timeout.
    ReadTimeout,
    /// request data could not be written within the write timeout.
    WriteTimeout,
    /// transport went away before the exchange completed.
    PrematureChannelClose,
    /// peer negotiated a protocol the pool can not multiplex streams on.
    NegotiationProtocolMismatch,
    /// released stream is unknown to the connection it claims to belong to.
    NotAMemberStream(StreamId),
    /// released stream belongs to a connection this pool does not track.
    UnknownConnection(ConnectionId),
    /// pool close did not finish in time.
    ShutdownTimeout(Duration),
    /// stream was refused by a graceful shutdown of it's connection.
    GoAway(GoAwayError),
    /// exchange was abandoned by it's caller.
    Cancelled,
}

impl Error {
    /// Returns true when the failed request is known to have never been processed by remote peer
    /// and can be sent again on a different connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GoAway(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::Std(e) => fmt::Display::fmt(e, f),
            Self::Timeout(e) => fmt::Display::fmt(e, f),
            Self::QueueFull(size) => write!(f, "acquire queue of size {size} is full"),
            Self::PoolClosed => f.write_str("connection pool is closed"),
            Self::ConnectionAcquireTimeout => f.write_str(
                "timed out acquiring a stream from connection pool. \
                 increase max connections or acquire timeout, or lower the concurrency of requests",
            ),
            Self::AcquireQueueOverflow(size) => write!(
                f,
                "more than {size} requests are waiting for a stream. \
                 increase max pending acquires or shed load from the client"
            ),
            Self::ReadTimeout => f.write_str("response data was not received in time"),
            Self::WriteTimeout => f.write_str("request data was not sent in time"),
            Self::PrematureChannelClose => f.write_str("connection closed before the exchange was completed"),
            Self::NegotiationProtocolMismatch => {
                f.write_str("connection did not negotiate a protocol with stream multiplexing")
            }
            Self::NotAMemberStream(id) => write!(f, "stream {id} is not a member of it's connection"),
            Self::UnknownConnection(id) => write!(f, "connection {id} is not tracked by connection pool"),
            Self::ShutdownTimeout(dur) => write!(f, "connection pool failed to close within {dur:?}"),
            Self::GoAway(e) => fmt::Display::fmt(e, f),
            Self::Cancelled => f.write_str("exchange is cancelled"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Std(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Std(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Acquire,
    Read,
    Write,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquire => f.write_str("stream acquiring timeout"),
            Self::Read => f.write_str("response reading timeout"),
            Self::Write => f.write_str("request writing timeout"),
        }
    }
}

impl error::Error for TimeoutError {}

impl From<TimeoutError> for Error {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

/// error for stream opened after remote peer stopped accepting new streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAwayError {
    pub stream_id: StreamId,
    pub last_stream_id: StreamId,
}

impl fmt::Display for GoAwayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {} is refused by graceful shutdown of connection. last processed stream is {}",
            self.stream_id, self.last_stream_id
        )
    }
}

impl error::Error for GoAwayError {}

impl From<GoAwayError> for Error {
    fn from(e: GoAwayError) -> Self {
        Self::GoAway(e)
    }
}

/// error type for response payload exceeding the limit of it's collector.
#[derive(Debug)]
pub struct PayloadTooLarge {
    pub limit: usize,
}

impl fmt::Display for PayloadTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response payload is larger than {} bytes", self.limit)
    }
}

impl error::Error for PayloadTooLarge {}

impl From<PayloadTooLarge> for Error {
    fn from(e: PayloadTooLarge) -> Self {
        Self::Std(Box::new(e))
    }
}

/// error type for transport frames arriving out of order.
#[derive(Debug)]
pub enum ProtocolError {
    DataBeforeHead,
    DuplicateHead,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataBeforeHead => f.write_str("response data received before response head"),
            Self::DuplicateHead => f.write_str("response head received more than once"),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Std(Box::new(e))
    }
}
