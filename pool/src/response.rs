use core::{cmp, fmt};

use std::io;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, header::CONTENT_LENGTH};
use tracing::debug;

use crate::{
    error::{Error, PayloadTooLarge},
    executor::ResponseHandler,
};

const DEFAULT_PAYLOAD_LIMIT: usize = 1024 * 1024 * 8;

/// response trailers. inserted into extensions of response collected by [Collect].
#[derive(Debug, Clone)]
pub struct Trailers(pub HeaderMap);

/// [ResponseHandler] collecting the whole response into memory.
///
/// Payload larger than `PAYLOAD_LIMIT` bytes fails the exchange with [PayloadTooLarge].
pub struct Collect<const PAYLOAD_LIMIT: usize = DEFAULT_PAYLOAD_LIMIT> {
    head: Option<Response<()>>,
    body: BytesMut,
    trailers: Option<HeaderMap>,
}

impl<const PAYLOAD_LIMIT: usize> Default for Collect<PAYLOAD_LIMIT> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAYLOAD_LIMIT: usize> fmt::Debug for Collect<PAYLOAD_LIMIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collect")
            .field("limit", &PAYLOAD_LIMIT)
            .field("collected", &self.body.len())
            .finish()
    }
}

impl<const PAYLOAD_LIMIT: usize> Collect<PAYLOAD_LIMIT> {
    pub fn new() -> Self {
        Self {
            head: None,
            body: BytesMut::new(),
            trailers: None,
        }
    }

    /// change payload size limit.
    pub fn limit<const PAYLOAD_LIMIT_2: usize>(self) -> Collect<PAYLOAD_LIMIT_2> {
        Collect {
            head: self.head,
            body: self.body,
            trailers: self.trailers,
        }
    }
}

impl<const PAYLOAD_LIMIT: usize> ResponseHandler for Collect<PAYLOAD_LIMIT> {
    type Output = Response<Bytes>;

    fn on_head(&mut self, head: Response<()>) -> Result<(), Error> {
        let len = head
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok().and_then(|str| str.parse::<usize>().ok()));

        if let Some(len) = len {
            if len > PAYLOAD_LIMIT {
                debug!("content-length {len} of response is beyond payload limit");
                return Err(PayloadTooLarge { limit: PAYLOAD_LIMIT }.into());
            }
            self.body.reserve(cmp::min(len, PAYLOAD_LIMIT));
        }

        self.head = Some(head);
        Ok(())
    }

    async fn on_data(&mut self, data: Bytes) -> Result<(), Error> {
        if self.body.len() + data.len() > PAYLOAD_LIMIT {
            return Err(PayloadTooLarge { limit: PAYLOAD_LIMIT }.into());
        }
        self.body.extend_from_slice(&data);
        Ok(())
    }

    fn on_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        self.trailers = Some(trailers);
        Ok(())
    }

    fn on_complete(self) -> Result<Self::Output, Error> {
        let head = self
            .head
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;

        let (mut parts, _) = head.into_parts();

        if let Some(trailers) = self.trailers {
            parts.extensions.insert(Trailers(trailers));
        }

        Ok(Response::from_parts(parts, self.body.freeze()))
    }
}
