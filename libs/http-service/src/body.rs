use crate::error::{HttpError, TimeoutPhase};
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, Sleep};
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Boxed error type carried by response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased response body as handed out by every transport.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// What an open response body holds on its engine.
///
/// The tracker token keeps a graceful close waiting; the permit keeps the
/// connection counted against the engine's connection limit.
#[derive(Debug)]
pub(crate) struct Lease {
    _token: TaskTrackerToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    pub(crate) fn new(token: TaskTrackerToken, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            _token: token,
            _permit: permit,
        }
    }
}

pin_project! {
    /// Body that keeps its transport alive and enforces an idle timeout
    /// between chunks.
    ///
    /// The lease is released once the body is fully read, fails or is
    /// dropped.
    pub(crate) struct TrackedBody<B> {
        #[pin]
        inner: B,
        #[pin]
        idle: Option<Sleep>,
        timeout: Option<Duration>,
        lease: Option<Lease>,
    }
}

impl<B> TrackedBody<B> {
    pub(crate) fn new(inner: B, timeout: Option<Duration>, lease: Lease) -> Self {
        Self {
            inner,
            idle: timeout.map(tokio::time::sleep),
            timeout,
            lease: Some(lease),
        }
    }
}

impl<B> Body for TrackedBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(idle), Some(timeout)) = (this.idle.as_mut().as_pin_mut(), this.timeout)
                {
                    idle.reset(Instant::now() + *timeout);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.lease.take();
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.lease.take();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if let Some(idle) = this.idle.as_mut().as_pin_mut()
                    && idle.poll(cx).is_ready()
                {
                    this.lease.take();
                    let after = this.timeout.unwrap_or_default();
                    return Poll::Ready(Some(Err(Box::new(HttpError::Timeout {
                        phase: TimeoutPhase::Body,
                        after,
                    }))));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Body wrapper that enforces size limits during streaming.
    ///
    /// Returns [`HttpError::BodyTooLarge`] once more than `limit` bytes
    /// have been read.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    /// Returns the number of bytes read so far.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(HttpError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(HttpError::from_boxed(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A fully drained body.
#[derive(Debug, Default)]
pub struct Drained {
    pub bytes: Bytes,
    pub trailers: Option<HeaderMap>,
}

/// Reads the whole body, failing once it grows past `limit` bytes.
///
/// # Errors
/// Returns `HttpError::BodyTooLarge` past the limit, or the transport error
/// that interrupted the body.
pub async fn drain(body: ResponseBody, limit: usize) -> Result<Drained, HttpError> {
    let mut collected = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::from_boxed)?;
        match frame.into_data() {
            Ok(chunk) => {
                if collected.len() + chunk.len() > limit {
                    return Err(HttpError::BodyTooLarge {
                        limit,
                        actual: collected.len() + chunk.len(),
                    });
                }
                collected.extend_from_slice(&chunk);
            }
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    trailers.get_or_insert_with(HeaderMap::new).extend(t);
                }
            }
        }
    }

    Ok(Drained {
        bytes: collected.freeze(),
        trailers,
    })
}

/// Copies the body into `sink`, then flushes and shuts the sink down.
///
/// Returns the number of bytes written and any trailers.
pub(crate) async fn drain_into<W>(
    body: ResponseBody,
    sink: &mut W,
) -> Result<(usize, Option<HeaderMap>), HttpError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut trailers: Option<HeaderMap> = None;
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::from_boxed)?;
        match frame.into_data() {
            Ok(chunk) => {
                sink.write_all(&chunk).await.map_err(HttpError::Sink)?;
                written += chunk.len();
            }
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    trailers.get_or_insert_with(HeaderMap::new).extend(t);
                }
            }
        }
    }
    sink.flush().await.map_err(HttpError::Sink)?;
    sink.shutdown().await.map_err(HttpError::Sink)?;

    Ok((written, trailers))
}
