//! Request normalization: caller options plus service policy in, a canonical
//! [`RequestDescriptor`] out. Pure; no I/O happens here.

use crate::config::{JSON_CONTENT_TYPE, RequestOptions, ServiceConfig};
use crate::error::{ConfigError, HttpError};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::Value;
use std::time::Duration;

/// Body handed to the `post`/`put` shortcuts.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Serialized to JSON text unless the caller set a non-JSON content type
    Json(Value),
    /// Sent byte-for-byte
    Raw(Bytes),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Raw(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(Bytes::from(text))
    }
}

impl Payload {
    /// Encodes the payload for a request whose content type is `content_type`.
    ///
    /// JSON values are serialized unless a non-JSON content type was set, in
    /// which case a string value goes out as its raw text.
    ///
    /// # Errors
    /// Returns `HttpError::Json` if serialization fails.
    pub fn encode(self, content_type: Option<&str>) -> Result<Bytes, HttpError> {
        match self {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Json(value) if content_type.is_some_and(|ct| !is_json_media_type(ct)) => {
                Ok(match value {
                    Value::String(text) => Bytes::from(text),
                    other => Bytes::from(other.to_string()),
                })
            }
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }
}

/// Compares the media type essence, ignoring parameters and case.
fn is_json_media_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

/// A canonical request, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Fully-qualified URL, or an origin-relative path for a bound transport
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Single timeout alias, only present when it was not fanned out
    pub timeout: Option<Duration>,
    pub headers_timeout: Option<Duration>,
    pub body_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub opaque: Option<Value>,
}

/// Per-service normalization policy, fixed at construction.
#[derive(Debug, Clone)]
pub struct Normalizer {
    base_url: Option<String>,
    bound: bool,
    alias_on_bound: bool,
    correlation_header: Option<HeaderName>,
    defaults: RequestOptions,
}

impl Normalizer {
    /// # Errors
    /// Returns `ConfigError::InvalidCorrelationHeader` when the configured
    /// correlation header is not a valid header name.
    pub fn from_config(service: &str, config: &ServiceConfig) -> Result<Self, ConfigError> {
        let correlation_header = config
            .correlation_header_name
            .as_deref()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ConfigError::InvalidCorrelationHeader {
                        service: service.to_owned(),
                        name: name.to_owned(),
                    }
                })
            })
            .transpose()?;

        Ok(Self {
            base_url: config.base_url.clone(),
            bound: config.transport_kind().is_bound(),
            alias_on_bound: config.alias_timeout_on_bound_transport,
            correlation_header,
            defaults: config.default_request_options.clone(),
        })
    }

    /// Resolves a caller path against the service's origin policy.
    ///
    /// A bound transport already encodes the origin, so the path goes through
    /// unchanged; otherwise `base_url` is prepended when configured.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> String {
        match &self.base_url {
            Some(base) if !self.bound => format!("{base}{path}"),
            _ => path.to_owned(),
        }
    }

    /// Builds the descriptor for an `execute` call.
    ///
    /// # Errors
    /// Fails on an invalid method, header name or header value.
    pub fn normalize(
        &self,
        path: &str,
        options: RequestOptions,
        correlation_id: Option<&str>,
    ) -> Result<RequestDescriptor, HttpError> {
        let mut options = options.or_defaults(&self.defaults);

        if (!self.bound || self.alias_on_bound)
            && let Some(timeout) = options.timeout.take()
        {
            options.headers_timeout = Some(timeout);
            options.body_timeout = Some(timeout);
            options.connect.get_or_insert_default().timeout = Some(timeout);
        }

        let mut descriptor = self.descriptor(path, options)?;

        if matches!(descriptor.method, Method::POST | Method::PUT)
            && !descriptor.headers.contains_key(CONTENT_TYPE)
        {
            descriptor
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        }

        if let (Some(name), Some(id)) = (&self.correlation_header, correlation_id) {
            descriptor
                .headers
                .insert(name.clone(), HeaderValue::from_str(id)?);
        }

        Ok(descriptor)
    }

    /// Builds the descriptor for `stream`/`fetch_like`: path resolution only,
    /// options taken as given.
    ///
    /// # Errors
    /// Fails on an invalid method, header name or header value.
    pub fn passthrough(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<RequestDescriptor, HttpError> {
        self.descriptor(path, options)
    }

    fn descriptor(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<RequestDescriptor, HttpError> {
        let method = match options.method.as_deref() {
            Some(method) => Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(http::Error::from)?,
            None => Method::GET,
        };

        let mut headers = HeaderMap::with_capacity(options.headers.len() + 2);
        for (name, value) in &options.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        Ok(RequestDescriptor {
            path: self.resolve_path(path),
            method,
            headers,
            body: options.body,
            timeout: options.timeout,
            headers_timeout: options.headers_timeout,
            body_timeout: options.body_timeout,
            connect_timeout: options.connect.and_then(|c| c.timeout),
            opaque: options.opaque,
        })
    }
}

/// Pre-fills method and body for the `post`/`put` shortcuts.
///
/// A body already present on the options wins over `payload`.
pub(crate) fn with_payload(
    mut options: RequestOptions,
    method: &str,
    payload: Payload,
) -> Result<RequestOptions, HttpError> {
    if options.method.is_none() {
        options.method = Some(method.to_owned());
    }
    if options.body.is_none() {
        let encoded = payload.encode(options.header_value(CONTENT_TYPE.as_str()))?;
        options.body = Some(encoded);
    }
    Ok(options)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::TransportOptions;
    use serde_json::json;

    fn normalizer(config: &ServiceConfig) -> Normalizer {
        Normalizer::from_config("test", config).unwrap()
    }

    fn bound_config() -> ServiceConfig {
        ServiceConfig {
            transport_options: Some(TransportOptions::default()),
            ..ServiceConfig::with_base_url("http://h:8006")
        }
    }

    #[test]
    fn test_path_resolution() {
        let unbound = normalizer(&ServiceConfig::with_base_url("http://h:8006/api/"));
        assert_eq!(unbound.resolve_path("users"), "http://h:8006/api/users");

        let bare = normalizer(&ServiceConfig::default());
        assert_eq!(bare.resolve_path("http://other/x"), "http://other/x");

        let bound = normalizer(&bound_config());
        assert_eq!(bound.resolve_path("/users"), "/users");
    }

    #[test]
    fn test_timeout_alias_fans_out_without_bound_transport() {
        let n = normalizer(&ServiceConfig::default());
        let d = n
            .normalize(
                "http://h/x",
                RequestOptions::new().timeout(Duration::from_secs(2)),
                None,
            )
            .unwrap();
        assert_eq!(d.timeout, None);
        assert_eq!(d.headers_timeout, Some(Duration::from_secs(2)));
        assert_eq!(d.body_timeout, Some(Duration::from_secs(2)));
        assert_eq!(d.connect_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_timeout_alias_kept_on_bound_transport() {
        let n = normalizer(&bound_config());
        let d = n
            .normalize(
                "/x",
                RequestOptions::new().timeout(Duration::from_secs(2)),
                None,
            )
            .unwrap();
        assert_eq!(d.timeout, Some(Duration::from_secs(2)));
        assert_eq!(d.headers_timeout, None);
        assert_eq!(d.connect_timeout, None);
    }

    #[test]
    fn test_timeout_alias_on_bound_transport_when_enabled() {
        let config = ServiceConfig {
            alias_timeout_on_bound_transport: true,
            ..bound_config()
        };
        let d = normalizer(&config)
            .normalize(
                "/x",
                RequestOptions::new().timeout(Duration::from_millis(300)),
                None,
            )
            .unwrap();
        assert_eq!(d.timeout, None);
        assert_eq!(d.body_timeout, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_content_type_defaults_on_post_and_put_only() {
        let n = normalizer(&ServiceConfig::default());
        for (method, expected) in [("POST", true), ("put", true), ("GET", false), ("DELETE", false)]
        {
            let d = n
                .normalize("http://h/x", RequestOptions::new().method(method), None)
                .unwrap();
            assert_eq!(
                d.headers.get(CONTENT_TYPE).is_some(),
                expected,
                "method {method}"
            );
        }
    }

    #[test]
    fn test_caller_content_type_is_kept() {
        let n = normalizer(&ServiceConfig::default());
        let d = n
            .normalize(
                "http://h/x",
                RequestOptions::new()
                    .method("POST")
                    .header("content-type", "text/plain"),
                None,
            )
            .unwrap();
        assert_eq!(d.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(d.headers.get_all(CONTENT_TYPE).iter().count(), 1);
    }

    #[test]
    fn test_correlation_header_injected() {
        let config = ServiceConfig {
            correlation_header_name: Some("X-Request-Id".to_owned()),
            ..ServiceConfig::default()
        };
        let n = normalizer(&config);
        let d = n
            .normalize("http://h/x", RequestOptions::new(), Some("abc-123"))
            .unwrap();
        assert_eq!(d.headers.get("x-request-id").unwrap(), "abc-123");

        let without_id = n
            .normalize("http://h/x", RequestOptions::new(), None)
            .unwrap();
        assert!(without_id.headers.get("x-request-id").is_none());
    }

    #[test]
    fn test_correlation_id_ignored_without_header_name() {
        let n = normalizer(&ServiceConfig::default());
        let d = n
            .normalize("http://h/x", RequestOptions::new(), Some("abc"))
            .unwrap();
        assert!(d.headers.is_empty());
    }

    #[test]
    fn test_invalid_correlation_header_rejected() {
        let config = ServiceConfig {
            correlation_header_name: Some("bad header".to_owned()),
            ..ServiceConfig::default()
        };
        assert!(matches!(
            Normalizer::from_config("test", &config),
            Err(ConfigError::InvalidCorrelationHeader { .. })
        ));
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let config = ServiceConfig {
            default_request_options: RequestOptions::new()
                .method("DELETE")
                .opaque(json!({"tag": 1})),
            ..ServiceConfig::default()
        };
        let d = normalizer(&config)
            .normalize("http://h/x", RequestOptions::new(), None)
            .unwrap();
        assert_eq!(d.method, Method::DELETE);
        assert_eq!(d.opaque, Some(json!({"tag": 1})));
    }

    #[test]
    fn test_passthrough_skips_policy() {
        let config = ServiceConfig {
            correlation_header_name: Some("x-request-id".to_owned()),
            default_request_options: RequestOptions::new().method("DELETE"),
            ..ServiceConfig::with_base_url("http://h")
        };
        let d = normalizer(&config)
            .passthrough(
                "/x",
                RequestOptions::new()
                    .method("POST")
                    .timeout(Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(d.path, "http://h/x");
        assert_eq!(d.method, Method::POST);
        assert!(d.headers.is_empty());
        assert_eq!(d.timeout, Some(Duration::from_secs(1)));
        assert_eq!(d.headers_timeout, None);
    }

    #[test]
    fn test_payload_encoding() {
        let value = json!({"name": "x", "n": [1, 2]});
        let encoded = Payload::Json(value.clone()).encode(None).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&encoded).unwrap(), value);

        let explicit_json = Payload::Json(json!("s"))
            .encode(Some("Application/JSON; charset=utf-8"))
            .unwrap();
        assert_eq!(&explicit_json[..], br#""s""#);

        let plain = Payload::Json(json!("raw text")).encode(Some("text/plain")).unwrap();
        assert_eq!(&plain[..], b"raw text");

        let raw = Payload::from("a=1&b=2").encode(None).unwrap();
        assert_eq!(&raw[..], b"a=1&b=2");
    }

    #[test]
    fn test_with_payload_keeps_caller_body_and_method() {
        let options = RequestOptions::new().method("PATCH").body("preset");
        let options = with_payload(options, "POST", Payload::Json(json!({"a": 1}))).unwrap();
        assert_eq!(options.method.as_deref(), Some("PATCH"));
        assert_eq!(options.body.as_deref(), Some(&b"preset"[..]));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let n = normalizer(&ServiceConfig::default());
        let err = n
            .normalize("http://h/x", RequestOptions::new().method("GE T"), None)
            .unwrap_err();
        assert!(matches!(err, HttpError::RequestBuild(_)));
    }
}
