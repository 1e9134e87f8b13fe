//! Response materialization: one decoder per [`OutputMode`].

use crate::body::{ResponseBody, drain};
use crate::error::{ConfigError, HttpError};
use crate::json_stream::{JsonScanner, ScanError, StreamFilter};
use crate::mode::OutputMode;
use crate::response::{DecodedBody, Output, RawResponse, ResultEnvelope, is_ok_status};
use bytes::Bytes;
use futures::Stream;
use http_body::Body;
use pin_project_lite::pin_project;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// How a decoding output mode reads its body.
enum Decoder {
    Json,
    Text,
    TextStream,
    JsonStream(StreamFilter),
}

impl Decoder {
    fn for_mode(mode: OutputMode, filter: Option<StreamFilter>) -> Result<Option<Self>, ConfigError> {
        Ok(Some(match mode {
            OutputMode::FullResponse => return Ok(None),
            OutputMode::DirectStream => return Err(ConfigError::DirectStreamViaExecute),
            OutputMode::Json => Decoder::Json,
            OutputMode::Text => Decoder::Text,
            OutputMode::TextStream => Decoder::TextStream,
            OutputMode::JsonStream => {
                Decoder::JsonStream(filter.ok_or(ConfigError::MissingStreamFilter)?)
            }
        }))
    }
}

/// Limits and labels the decoders need.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodeContext<'a> {
    pub service: &'a str,
    pub max_body_size: usize,
}

/// Turns a raw response into the caller-facing shape for `mode`.
pub(crate) async fn materialize(
    raw: RawResponse,
    mode: OutputMode,
    filter: Option<StreamFilter>,
    cx: DecodeContext<'_>,
) -> Result<Output, HttpError> {
    let Some(decoder) = Decoder::for_mode(mode, filter)? else {
        return Ok(Output::Raw(raw));
    };

    let RawResponse { head, body } = raw;
    let (body, trailers) = match decoder {
        Decoder::Json => {
            let drained = drain(body, cx.max_body_size).await?;
            (DecodedBody::Json(parse_json(&drained.bytes, cx.service)?), drained.trailers)
        }
        Decoder::Text => {
            let drained = drain(body, cx.max_body_size).await?;
            let text = String::from_utf8_lossy(&drained.bytes).into_owned();
            (DecodedBody::Text(text), drained.trailers)
        }
        Decoder::TextStream => (DecodedBody::TextStream(TextStream::new(body)), None),
        Decoder::JsonStream(filter) => (
            DecodedBody::JsonStream(JsonStream::new(body, filter, cx.service)),
            None,
        ),
    };

    let status_code = head.status.as_u16();
    Ok(Output::Envelope(ResultEnvelope {
        ok: is_ok_status(status_code),
        status_code,
        headers: head.headers,
        body,
        trailers,
        opaque: head.opaque,
        context: head.context,
    }))
}

/// An empty body is `null`; anything else must parse.
fn parse_json(bytes: &Bytes, service: &str) -> Result<Value, HttpError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| {
        tracing::error!(
            service,
            error = %e,
            raw = %String::from_utf8_lossy(bytes),
            "Invalid JSON response format"
        );
        HttpError::Decode
    })
}

/// Length of a UTF-8 sequence cut off at the end of `buf`.
fn incomplete_tail(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

pin_project! {
    /// Lazily decoded UTF-8 chunks of a response body.
    ///
    /// A character split across two chunks is emitted whole with the later
    /// one. Single-pass; dropping the stream releases the connection.
    pub struct TextStream {
        #[pin]
        body: ResponseBody,
        pending: Vec<u8>,
        done: bool,
    }
}

impl TextStream {
    pub(crate) fn new(body: ResponseBody) -> Self {
        Self {
            body,
            pending: Vec::new(),
            done: false,
        }
    }
}

impl Stream for TextStream {
    type Item = Result<String, HttpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(None);
            }
            match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(chunk) = frame.into_data() else {
                        continue;
                    };
                    this.pending.extend_from_slice(&chunk);
                    let complete = this.pending.len() - incomplete_tail(this.pending);
                    if complete == 0 {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&this.pending[..complete]).into_owned();
                    this.pending.drain(..complete);
                    return Poll::Ready(Some(Ok(text)));
                }
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(HttpError::from_boxed(e))));
                }
                None => {
                    *this.done = true;
                    if !this.pending.is_empty() {
                        let rest = std::mem::take(this.pending);
                        return Poll::Ready(Some(Ok(String::from_utf8_lossy(&rest).into_owned())));
                    }
                }
            }
        }
    }
}

pin_project! {
    /// Lazily decoded JSON values selected by a [`StreamFilter`].
    ///
    /// Single-pass; dropping the stream releases the connection. A malformed
    /// document ends the stream with `HttpError::Decode`, after every value
    /// completed before the error has been yielded.
    pub struct JsonStream {
        #[pin]
        body: ResponseBody,
        scanner: JsonScanner,
        ready: VecDeque<Value>,
        failed: Option<ScanError>,
        service: String,
        done: bool,
    }
}

impl JsonStream {
    pub(crate) fn new(body: ResponseBody, filter: StreamFilter, service: &str) -> Self {
        Self {
            body,
            scanner: JsonScanner::new(filter),
            ready: VecDeque::new(),
            failed: None,
            service: service.to_owned(),
            done: false,
        }
    }
}

impl Stream for JsonStream {
    type Item = Result<Value, HttpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(value) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(value)));
            }
            if let Some(e) = this.failed.take() {
                tracing::error!(
                    service = %this.service,
                    error = %e.reason,
                    raw = %e.near,
                    "Invalid JSON response format"
                );
                return Poll::Ready(Some(Err(HttpError::Decode)));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            let scanned = match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(chunk) => this.scanner.feed(&chunk, this.ready),
                    Err(_) => continue,
                },
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(HttpError::from_boxed(e))));
                }
                None => {
                    *this.done = true;
                    this.scanner.finish(this.ready)
                }
            };
            if let Err(e) = scanned {
                *this.done = true;
                *this.failed = Some(e);
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::BoxError;
    use crate::config::TransportKind;
    use crate::response::{RequestContext, ResponseHead};
    use futures::StreamExt;
    use http::{HeaderMap, Method, StatusCode};
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};
    use serde_json::json;

    fn chunked(chunks: &[&[u8]]) -> ResponseBody {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = chunks
            .iter()
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        BodyExt::boxed(StreamBody::new(futures::stream::iter(frames)))
    }

    fn raw(status: u16, chunks: &[&[u8]]) -> RawResponse {
        RawResponse {
            head: ResponseHead {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                opaque: Some(json!("token")),
                context: RequestContext {
                    method: Method::GET,
                    url: "http://h/x".to_owned(),
                    transport: TransportKind::None,
                },
            },
            body: chunked(chunks),
        }
    }

    const CX: DecodeContext<'static> = DecodeContext {
        service: "test",
        max_body_size: 1024,
    };

    async fn envelope(raw: RawResponse, mode: OutputMode) -> ResultEnvelope {
        materialize(raw, mode, None, CX)
            .await
            .unwrap()
            .into_envelope()
            .unwrap()
    }

    #[test]
    fn test_incomplete_tail() {
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail("\u{e9}".as_bytes()), 0);
        assert_eq!(incomplete_tail(&"\u{e9}".as_bytes()[..1]), 1);
        assert_eq!(incomplete_tail(&"\u{20ac}".as_bytes()[..2]), 2);
        assert_eq!(incomplete_tail(&"\u{1f600}".as_bytes()[..3]), 3);
        assert_eq!(incomplete_tail(b""), 0);
    }

    #[tokio::test]
    async fn test_json_mode() {
        let env = envelope(raw(200, &[b"{\"p1\":", b"\"x\"}"]), OutputMode::Json).await;
        assert!(env.ok);
        assert_eq!(env.status_code, 200);
        assert_eq!(env.body.as_json(), Some(&json!({"p1": "x"})));
        assert_eq!(env.opaque, Some(json!("token")));
    }

    #[tokio::test]
    async fn test_empty_json_body_is_null() {
        let env = envelope(raw(204, &[]), OutputMode::Json).await;
        assert_eq!(env.body.as_json(), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let err = materialize(raw(200, &[b"<html>"]), OutputMode::Json, None, CX)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Decode));
    }

    #[tokio::test]
    async fn test_text_mode_and_non_ok() {
        let env = envelope(raw(503, &[b"down ", b"for maintenance"]), OutputMode::Text).await;
        assert!(!env.ok);
        assert_eq!(env.body.as_text(), Some("down for maintenance"));
    }

    #[tokio::test]
    async fn test_full_response_is_untouched() {
        let out = materialize(raw(404, &[b"raw"]), OutputMode::FullResponse, None, CX)
            .await
            .unwrap();
        let raw = out.into_raw().unwrap();
        assert_eq!(raw.status(), StatusCode::NOT_FOUND);
        assert_eq!(&raw.bytes(16).await.unwrap()[..], b"raw");
    }

    #[tokio::test]
    async fn test_direct_stream_rejected() {
        let err = materialize(raw(200, &[]), OutputMode::DirectStream, None, CX)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpError::Config(ConfigError::DirectStreamViaExecute)
        ));
    }

    #[tokio::test]
    async fn test_json_stream_requires_filter() {
        let err = materialize(raw(200, &[]), OutputMode::JsonStream, None, CX)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpError::Config(ConfigError::MissingStreamFilter)
        ));
    }

    #[tokio::test]
    async fn test_text_stream_keeps_split_characters_whole() {
        let euro = "\u{20ac}".as_bytes();
        let first = [b"a".as_slice(), &euro[..1]].concat();
        let second = [&euro[1..], b"b".as_slice()].concat();

        let stream = TextStream::new(chunked(&[&first, &second]));
        let parts: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(parts, vec!["a".to_owned(), "\u{20ac}b".to_owned()]);
    }

    #[tokio::test]
    async fn test_text_stream_flushes_invalid_tail() {
        let stream = TextStream::new(chunked(&[b"ok", &[0xE2]]));
        let parts: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(parts, vec!["ok".to_owned(), "\u{fffd}".to_owned()]);
    }

    #[tokio::test]
    async fn test_json_stream_mode() {
        let filter: StreamFilter = "*".parse().unwrap();
        let out = materialize(
            raw(200, &[b"[{\"a\":1},", b"{\"a\":2}]"]),
            OutputMode::JsonStream,
            Some(filter),
            CX,
        )
        .await
        .unwrap();
        let stream = out.into_envelope().unwrap().body.into_json_stream().unwrap();
        let values: Vec<Value> = stream.map(Result::unwrap).collect().await;
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn test_json_stream_malformed_ends_with_decode_error() {
        let stream = JsonStream::new(chunked(&[b"[1, ", b"}"]), "*".parse().unwrap(), "test");
        let items: Vec<Result<Value, HttpError>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert!(matches!(items[1], Err(HttpError::Decode)));
    }

    #[tokio::test]
    async fn test_json_stream_keeps_values_before_error_in_same_chunk() {
        let stream = JsonStream::new(chunked(&[b"[1, 2, }"]), "*".parse().unwrap(), "test");
        let items: Vec<Result<Value, HttpError>> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert_eq!(items[1].as_ref().unwrap(), &json!(2));
        assert!(matches!(items[2], Err(HttpError::Decode)));
    }
}
