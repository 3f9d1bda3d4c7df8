//! drive one request/response exchange on a pooled stream.

use core::{
    future::{Future, poll_fn},
    pin::{Pin, pin},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use std::{io, sync::Arc};

use bytes::Bytes;
use futures_core::stream::Stream as _;
use http::{
    HeaderMap, HeaderName, Request, Response, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, EXPECT, HeaderValue, TE, TRANSFER_ENCODING, UPGRADE},
    request,
};
use tokio::{
    select,
    time::{Instant, Sleep, sleep},
    try_join,
};
use tracing::{debug, trace, warn};

use crate::{
    body::{BodySize, BoxStream, LimitedBody, RequestBody},
    error::{Error, ProtocolError, TimeoutError},
    outcome::{ExecutionOutcome, OutputFuture, decorate},
    policy::AcquireQueue,
    pool::Pool,
    record::ExchangeContext,
    timeout::{Timeout, TimeoutConfig},
    transport::{Frame, Provider, RecvStream, SendStream, Stream},
};

/// consumer of one response.
///
/// Response data is only read from transport when the future returned by
/// [ResponseHandler::on_data] for the previous chunk has resolved.
pub trait ResponseHandler: Send + 'static {
    type Output: Send + 'static;

    /// called once with the final response head. interim heads are never passed.
    fn on_head(&mut self, head: Response<()>) -> Result<(), Error>;

    fn on_data(&mut self, data: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    fn on_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        let _ = trailers;
        Ok(())
    }

    /// called when response is finished without error.
    fn on_complete(self) -> Result<Self::Output, Error>;

    /// called when exchange failed before response is finished.
    fn on_error(&mut self, err: &Error) {
        let _ = err;
    }
}

/// request extension. when present request body writing and response reading happen
/// concurrently and response reads are not bound by read timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullDuplex;

#[derive(Debug, Clone, Copy)]
enum State {
    Acquiring,
    Configured,
    Writing,
    AwaitingResponse,
    Complete,
    Failed,
}

/// Executor running request/response exchanges on streams from [Pool].
pub struct RequestExecutor<P>
where
    P: Provider,
{
    pool: Pool<P>,
    queue: Arc<AcquireQueue>,
    timeout: TimeoutConfig,
    next_id: Arc<AtomicU64>,
}

impl<P> Clone for RequestExecutor<P>
where
    P: Provider,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            timeout: self.timeout,
            next_id: self.next_id.clone(),
        }
    }
}

impl<P> RequestExecutor<P>
where
    P: Provider,
{
    pub fn new(pool: Pool<P>) -> Self {
        let config = *pool.config();
        Self {
            pool,
            queue: Arc::new(AcquireQueue::from_config(&config)),
            timeout: config.timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn pool(&self) -> &Pool<P> {
        &self.pool
    }

    /// start exchange in background and return the future resolving to it's output.
    ///
    /// Dropping the returned future cancels the exchange.
    ///
    /// # Panics:
    /// When called outside of tokio runtime.
    pub fn execute<H>(&self, req: Request<RequestBody>, handler: H) -> OutputFuture<H::Output>
    where
        H: ResponseHandler,
    {
        let (outcome, output) = ExecutionOutcome::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(self.clone().drive(id, req, handler, outcome));
        output
    }

    /// execute exchange and wait for it's output.
    pub async fn send<H>(&self, req: Request<RequestBody>, handler: H) -> Result<H::Output, Error>
    where
        H: ResponseHandler,
    {
        self.execute(req, handler).await
    }

    async fn drive<H>(self, id: u64, req: Request<RequestBody>, mut handler: H, outcome: ExecutionOutcome<H::Output>)
    where
        H: ResponseHandler,
    {
        trace!("execution {id}: {:?}", State::Acquiring);

        let mut stream = match self.queue.acquire(&self.pool).await {
            Ok(stream) => stream,
            Err(e) => {
                trace!("execution {id}: {:?}", State::Failed);
                fail(&mut handler, &outcome, e);
                return;
            }
        };

        let abort = stream.abort_handle().clone();
        outcome.on_failure({
            let abort = abort.clone();
            move || {
                abort.abort(Error::Cancelled);
                Ok(())
            }
        });

        let ctx = ExchangeContext {
            execution_id: id,
            protocol: Version::HTTP_2,
        };

        let res = match stream.attach(ctx) {
            Ok(()) => {
                stream.set_auto_read(false);
                trace!("execution {id}: {:?} on stream {}", State::Configured, stream.stream_id());

                if stream.is_active() {
                    select! {
                        biased;
                        e = abort.aborted() => Err(e),
                        res = exchange(id, &mut *stream, req, &mut handler, &self.timeout) => res,
                    }
                } else {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
                }
            }
            Err(e) => Err(e),
        };

        match res {
            Ok(()) => {
                trace!("execution {id}: {:?}", State::Complete);
                let res = handler.on_complete();
                // stream is given back before caller observes the output.
                match (self.pool.release(stream), res) {
                    (Ok(()), Ok(output)) => {
                        outcome.try_succeed(output);
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        outcome.try_fail(e);
                    }
                }
            }
            Err(e) => {
                trace!("execution {id}: {:?}", State::Failed);
                debug!("execution {id} failed on stream {}: {e}", stream.stream_id());
                stream.close();
                if let Err(release) = self.pool.release(stream) {
                    warn!("execution {id} failed to release stream: {release}");
                }
                fail(&mut handler, &outcome, e);
            }
        }
    }
}

fn fail<H>(handler: &mut H, outcome: &ExecutionOutcome<H::Output>, err: Error)
where
    H: ResponseHandler,
{
    let err = decorate(err);
    handler.on_error(&err);
    outcome.try_fail(err);
}

async fn exchange<S, H>(
    id: u64,
    stream: &mut S,
    req: Request<RequestBody>,
    handler: &mut H,
    timeout: &TimeoutConfig,
) -> Result<(), Error>
where
    S: Stream,
    H: ResponseHandler,
{
    let (parts, body) = req.into_parts();
    let full_duplex = parts.extensions.get::<FullDuplex>().is_some();

    let (size, mut body) = body.into_limited();
    let head = adapt_head(parts, size);

    let end_of_stream = matches!(size, BodySize::None | BodySize::Sized(0));
    let expect = !full_duplex && is_expect_continue(head.headers());

    let (tx, rx) = stream.split();

    let mut write_timer = Box::pin(sleep(timeout.write_timeout));

    trace!("execution {id}: {:?}", State::Writing);

    write(tx.send_head(head, end_of_stream), write_timer.as_mut(), timeout.write_timeout).await?;

    if end_of_stream {
        trace!("execution {id}: {:?}", State::AwaitingResponse);
        return read_response(rx, handler, false, Some(timeout.read_timeout)).await;
    }

    if full_duplex {
        trace!("execution {id}: {:?}", State::AwaitingResponse);
        let write = write_body(tx, &mut body, write_timer.as_mut(), timeout.write_timeout);
        let read = read_response(rx, handler, false, None);
        try_join!(write, read)?;
        return Ok(());
    }

    if expect {
        let head_seen = match await_continue(rx, handler, timeout.expect_continue_timeout).await? {
            Continue::Body => {
                write_body(tx, &mut body, write_timer.as_mut(), timeout.write_timeout).await?;
                false
            }
            Continue::Skip => {
                debug!("execution {id}: final response arrived before request body. body is not sent");
                body.cancel();
                true
            }
        };

        trace!("execution {id}: {:?}", State::AwaitingResponse);
        return read_response(rx, handler, head_seen, None).await;
    }

    write_body(tx, &mut body, write_timer.as_mut(), timeout.write_timeout).await?;

    trace!("execution {id}: {:?}", State::AwaitingResponse);
    read_response(rx, handler, false, Some(timeout.read_timeout)).await
}

enum Continue {
    Body,
    Skip,
}

// wait for interim response of expect-continue request. the wait is bounded by a one-shot timer
// and the body is sent when it elapses.
async fn await_continue<R, H>(rx: &mut R, handler: &mut H, dur: Duration) -> Result<Continue, Error>
where
    R: RecvStream,
    H: ResponseHandler,
{
    let mut timer = pin!(sleep(dur));

    loop {
        let frame = match rx.read().timeout(timer.as_mut()).await {
            Ok(frame) => frame?,
            Err(_) => {
                trace!("no interim response within {dur:?}. sending request body");
                return Ok(Continue::Body);
            }
        };

        match frame {
            Some(Frame::Head(head)) if head.status() == StatusCode::CONTINUE => return Ok(Continue::Body),
            Some(Frame::Head(head)) if head.status().is_informational() => continue,
            Some(Frame::Head(head)) => {
                handler.on_head(head)?;
                return Ok(Continue::Skip);
            }
            Some(_) => return Err(ProtocolError::DataBeforeHead.into()),
            None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }
}

async fn write<F>(fut: F, mut timer: Pin<&mut Sleep>, dur: Duration) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    timer.as_mut().reset(Instant::now() + dur);
    fut.timeout(timer).await.map_err(|_| TimeoutError::Write)?
}

async fn write_body<T>(
    tx: &mut T,
    body: &mut LimitedBody<BoxStream>,
    mut timer: Pin<&mut Sleep>,
    dur: Duration,
) -> Result<(), Error>
where
    T: SendStream,
{
    let mut body = Pin::new(body);

    while let Some(bytes) = poll_fn(|cx| body.as_mut().poll_next(cx)).await {
        let bytes = bytes?;
        // declared length reached. the chunk carries end of stream.
        let end_of_stream = body.is_terminated();
        write(tx.send_data(bytes, end_of_stream), timer.as_mut(), dur).await?;
        if end_of_stream {
            return Ok(());
        }
    }

    write(tx.send_data(Bytes::new(), true), timer, dur).await
}

async fn read_response<R, H>(
    rx: &mut R,
    handler: &mut H,
    mut head_seen: bool,
    dur: Option<Duration>,
) -> Result<(), Error>
where
    R: RecvStream,
    H: ResponseHandler,
{
    let mut timer = dur.map(|dur| (Box::pin(sleep(dur)), dur));

    loop {
        let frame = match timer.as_mut() {
            Some((timer, dur)) => {
                timer.as_mut().reset(Instant::now() + *dur);
                rx.read().timeout(timer.as_mut()).await.map_err(|_| TimeoutError::Read)??
            }
            None => rx.read().await?,
        };

        match frame {
            Some(Frame::Head(head)) => {
                if head.status().is_informational() {
                    trace!("skipping interim response {}", head.status());
                    continue;
                }
                if head_seen {
                    return Err(ProtocolError::DuplicateHead.into());
                }
                head_seen = true;
                handler.on_head(head)?;
            }
            Some(Frame::Data(data)) => {
                if !head_seen {
                    return Err(ProtocolError::DataBeforeHead.into());
                }
                handler.on_data(data).await?;
            }
            Some(Frame::Trailers(trailers)) => {
                if !head_seen {
                    return Err(ProtocolError::DataBeforeHead.into());
                }
                handler.on_trailers(trailers)?;
            }
            None if head_seen => return Ok(()),
            // transport is gone before response head.
            None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }
}

// headers with connection level meaning. multiplexed protocols forbid them.
const CONNECTION_SPECIFIC: [HeaderName; 5] = [
    CONNECTION,
    TRANSFER_ENCODING,
    UPGRADE,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
];

fn adapt_head(parts: request::Parts, size: BodySize) -> Request<()> {
    let mut head = Request::from_parts(parts, ());
    *head.version_mut() = Version::HTTP_2;

    let headers = head.headers_mut();

    for name in CONNECTION_SPECIFIC.iter() {
        headers.remove(name);
    }

    if headers.get(TE).is_some_and(|v| !v.as_bytes().eq_ignore_ascii_case(b"trailers")) {
        headers.remove(TE);
    }

    match size {
        BodySize::None => {
            headers.remove(CONTENT_LENGTH);
            headers.remove(EXPECT);
        }
        BodySize::Sized(0) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            headers.remove(EXPECT);
        }
        BodySize::Sized(len) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        BodySize::Stream => {
            headers.remove(CONTENT_LENGTH);
        }
    }

    head
}

fn is_expect_continue(headers: &HeaderMap) -> bool {
    headers
        .get(EXPECT)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}
