use crate::body::{LimitedBody, ResponseBody, drain};
use crate::config::TransportKind;
use crate::error::HttpError;
use crate::materialize::{JsonStream, TextStream};
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// `true` for any status in the 2xx class.
#[must_use]
pub fn is_ok_status(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}

/// Where a call went and through which transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub method: Method,
    pub url: String,
    pub transport: TransportKind,
}

/// Status line and headers of a response whose body has not been read.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The caller's opaque token, echoed back untouched
    pub opaque: Option<Value>,
    pub context: RequestContext,
}

/// The transport's response exactly as produced, body unread.
///
/// Returned as-is by the `fullResponse` output mode.
#[derive(Debug)]
pub struct RawResponse {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

impl RawResponse {
    pub(crate) fn from_response(
        response: Response<ResponseBody>,
        opaque: Option<Value>,
        context: RequestContext,
    ) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            head: ResponseHead {
                status: parts.status,
                headers: parts.headers,
                opaque,
                context,
            },
            body,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Reads the whole body, up to `limit` bytes.
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` past the limit, or the transport error
    /// that interrupted the body.
    pub async fn bytes(self, limit: usize) -> Result<Bytes, HttpError> {
        Ok(drain(self.body, limit).await?.bytes)
    }
}

/// A decoded response body, shaped by the output mode.
pub enum DecodedBody {
    /// `json` mode; an empty body is `Value::Null`
    Json(Value),
    /// `text` mode
    Text(String),
    /// `textStream` mode
    TextStream(TextStream),
    /// `jsonStream` mode
    JsonStream(JsonStream),
}

impl DecodedBody {
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            DecodedBody::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedBody::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_json(self) -> Option<Value> {
        match self {
            DecodedBody::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_text_stream(self) -> Option<TextStream> {
        match self {
            DecodedBody::TextStream(stream) => Some(stream),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_json_stream(self) -> Option<JsonStream> {
        match self {
            DecodedBody::JsonStream(stream) => Some(stream),
            _ => None,
        }
    }
}

impl fmt::Debug for DecodedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            DecodedBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            DecodedBody::TextStream(_) => f.write_str("TextStream(..)"),
            DecodedBody::JsonStream(_) => f.write_str("JsonStream(..)"),
        }
    }
}

/// Uniform result of every decoding output mode.
///
/// The same shape is raised inside [`HttpError::Status`] when a service
/// throws on non-ok responses.
#[derive(Debug)]
pub struct ResultEnvelope {
    pub ok: bool,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: DecodedBody,
    /// Known once the body was drained; always `None` for stream modes
    pub trailers: Option<HeaderMap>,
    pub opaque: Option<Value>,
    pub context: RequestContext,
}

/// What [`HttpService::execute`](crate::HttpService::execute) hands back.
#[derive(Debug)]
pub enum Output {
    Envelope(ResultEnvelope),
    /// `fullResponse` mode
    Raw(RawResponse),
}

impl Output {
    #[must_use]
    pub fn into_envelope(self) -> Option<ResultEnvelope> {
        match self {
            Output::Envelope(envelope) => Some(envelope),
            Output::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn into_raw(self) -> Option<RawResponse> {
        match self {
            Output::Raw(raw) => Some(raw),
            Output::Envelope(_) => None,
        }
    }
}

/// Outcome of piping a body into a caller sink.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    pub opaque: Option<Value>,
    pub trailers: Option<HeaderMap>,
    pub bytes_written: usize,
}

/// Fetch-style response with body-reading helpers.
///
/// Unlike the envelope path, no status policy applies: callers check
/// [`ok`](Self::ok) themselves. Whole-body reads enforce `max_body_size`.
#[derive(Debug)]
pub struct FetchResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
    pub(crate) context: RequestContext,
}

impl FetchResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.inner.status().is_success()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if the body exceeds the limit.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        Ok(drain(self.inner.into_body(), self.max_body_size).await?.bytes)
    }

    /// Reads the body as UTF-8, replacing invalid sequences.
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if the body exceeds the limit.
    pub async fn text(self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if the body exceeds the limit.
    /// Returns `HttpError::Json` if parsing fails.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The body as a stream. No size limit is enforced.
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.inner.into_body()
    }

    /// The body as a stream that fails past `max_body_size`.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    fn fetch_response(status: u16, body: &'static str, limit: usize) -> FetchResponse {
        let body: ResponseBody = Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed();
        FetchResponse {
            inner: Response::builder().status(status).body(body).unwrap(),
            max_body_size: limit,
            context: RequestContext {
                method: Method::GET,
                url: "http://h/".to_owned(),
                transport: TransportKind::None,
            },
        }
    }

    #[test]
    fn test_ok_iff_2xx() {
        for code in 100..600 {
            assert_eq!(is_ok_status(code), code / 100 == 2, "status {code}");
        }
    }

    #[tokio::test]
    async fn test_fetch_response_json() {
        let response = fetch_response(201, r#"{"id": 7}"#, 1024);
        assert!(response.ok());
        let value: Value = response.json().await.unwrap();
        assert_eq!(value, serde_json::json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_fetch_response_keeps_parser_error() {
        let response = fetch_response(200, "not json", 1024);
        let err = response.json::<Value>().await.unwrap_err();
        assert!(matches!(err, HttpError::Json(_)));
    }

    #[tokio::test]
    async fn test_fetch_response_size_limit() {
        let response = fetch_response(500, "0123456789", 4);
        assert!(!response.ok());
        assert!(matches!(
            response.text().await,
            Err(HttpError::BodyTooLarge { limit: 4, .. })
        ));
    }

    #[test]
    fn test_decoded_body_debug_hides_streams() {
        let body = DecodedBody::Json(serde_json::json!({"a": 1}));
        assert!(format!("{body:?}").starts_with("Json("));

        let stream = TextStream::new(Full::new(Bytes::new()).map_err(|never| match never {}).boxed());
        assert_eq!(format!("{:?}", DecodedBody::TextStream(stream)), "TextStream(..)");
    }
}
