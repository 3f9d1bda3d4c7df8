use core::{
    fmt, mem,
    pin::Pin,
    task::{Context, Poll, ready},
};

use std::error;

use bytes::Bytes;
use futures_core::stream::Stream;
use pin_project_lite::pin_project;

/// boxed error type produced by request body streams.
pub type BodyError = Box<dyn error::Error + Send + Sync>;

pub(crate) type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, BodyError>> + Send>>;

/// declared size of request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// no body at all.
    None,
    /// body with a known length in bytes. `content-length` header is derived from it.
    Sized(u64),
    /// body with unknown length. whatever the producer emits is written.
    Stream,
}

/// request body consumed by [RequestExecutor](crate::RequestExecutor).
pub struct RequestBody {
    size: BodySize,
    stream: Option<BoxStream>,
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestBody({:?})", self.size)
    }
}

impl RequestBody {
    /// body with nothing to send.
    pub const fn none() -> Self {
        Self {
            size: BodySize::None,
            stream: None,
        }
    }

    /// body with declared length. producer emitting more than `len` bytes is cut short.
    pub fn sized<S, E>(len: u64, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        BodyError: From<E>,
    {
        Self {
            size: BodySize::Sized(len),
            stream: Some(Box::pin(MapErr { stream })),
        }
    }

    /// body with unknown length.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        BodyError: From<E>,
    {
        Self {
            size: BodySize::Stream,
            stream: Some(Box::pin(MapErr { stream })),
        }
    }

    pub fn size(&self) -> BodySize {
        self.size
    }

    /// wrap body producer into [LimitedBody] bound by declared size.
    pub(crate) fn into_limited(self) -> (BodySize, LimitedBody<BoxStream>) {
        let limit = match self.size {
            BodySize::Sized(len) => Some(len),
            BodySize::None | BodySize::Stream => None,
        };
        (self.size, LimitedBody::new(self.stream, limit))
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self {
                size: BodySize::Sized(0),
                stream: None,
            };
        }

        let len = bytes.len() as u64;
        Self::sized(len, Once { bytes: Some(bytes) })
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(vec: Vec<u8>) -> Self {
        Self::from(Bytes::from(vec))
    }
}

impl From<String> for RequestBody {
    fn from(string: String) -> Self {
        Self::from(Bytes::from(string))
    }
}

impl From<&'static str> for RequestBody {
    fn from(str: &'static str) -> Self {
        Self::from(Bytes::from_static(str.as_bytes()))
    }
}

pin_project! {
    struct MapErr<S> {
        #[pin]
        stream: S,
    }
}

impl<S, E> Stream for MapErr<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    BodyError: From<E>,
{
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .stream
            .poll_next(cx)
            .map(|opt| opt.map(|res| res.map_err(BodyError::from)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}

struct Once {
    bytes: Option<Bytes>,
}

impl Stream for Once {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().bytes.take().map(Ok))
    }
}

/// Adapter between a lazy producer of body chunks and the transport writing them.
///
/// - cumulative bytes yielded never exceed the declared limit. the chunk crossing the limit is
///   truncated, the producer is dropped right away and the stream ends even when producer has
///   more data queued.
/// - producer error is yielded once and the stream ends after it.
/// - after end of stream every poll yields `None` regardless of producer.
/// - [LimitedBody::cancel] drops the producer. dropping is how cancellation reaches it.
pub struct LimitedBody<B> {
    body: State<B>,
    remaining: Option<u64>,
}

enum State<B> {
    Producing(B),
    Finished,
    Cancelled,
}

impl<B> LimitedBody<B> {
    pub fn new(body: Option<B>, limit: Option<u64>) -> Self {
        Self {
            body: match body {
                Some(body) => State::Producing(body),
                None => State::Finished,
            },
            remaining: limit,
        }
    }

    /// stop producing. Returns true when producer was still alive and has been cancelled by this call.
    pub fn cancel(&mut self) -> bool {
        match self.body {
            State::Producing(_) => {
                self.body = State::Cancelled;
                true
            }
            State::Finished | State::Cancelled => false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        !matches!(self.body, State::Producing(_))
    }

    fn finish(&mut self) {
        drop(mem::replace(&mut self.body, State::Finished));
    }
}

impl<B, E> Stream for LimitedBody<B>
where
    B: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let State::Producing(ref mut body) = this.body else {
                return Poll::Ready(None);
            };

            if this.remaining == Some(0) {
                this.cancel();
                return Poll::Ready(None);
            }

            match ready!(Pin::new(body).poll_next(cx)) {
                Some(Ok(mut chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }

                    if let Some(remaining) = this.remaining.as_mut() {
                        if chunk.len() as u64 >= *remaining {
                            // declared length reached. cut the producer off.
                            chunk.truncate(*remaining as usize);
                            *remaining = 0;
                            this.cancel();
                        } else {
                            *remaining -= chunk.len() as u64;
                        }
                    }

                    return Poll::Ready(Some(Ok(chunk)));
                }
                Some(Err(e)) => {
                    this.finish();
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.finish();
                    return Poll::Ready(None);
                }
            }
        }
    }
}
