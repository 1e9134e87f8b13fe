use crate::response::ResultEnvelope;
use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
    /// Path sent over a bound transport does not start with `/`
    RelativePath,
}

/// Request phase a timeout fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the connection
    Connect,
    /// Waiting for the response head
    Headers,
    /// Waiting for the next body chunk
    Body,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Headers => "headers",
            TimeoutPhase::Body => "body",
        })
    }
}

/// Caller or configuration mistakes, detected before any network activity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid output mode '{0}'")]
    InvalidOutputMode(String),

    #[error("service '{service}': a bound transport requires base_url")]
    MissingBaseUrl { service: String },

    #[error("service '{service}': invalid base_url '{url}': {reason}")]
    InvalidBaseUrl {
        service: String,
        url: String,
        reason: String,
    },

    #[error("service '{service}': invalid correlation header name '{name}'")]
    InvalidCorrelationHeader { service: String, name: String },

    #[error("jsonStream mode requires a stream filter expression")]
    MissingStreamFilter,

    #[error("invalid stream filter expression '{0}'")]
    InvalidStreamFilter(String),

    #[error("body is missing")]
    NullBody,

    #[error("directStream output goes through stream(), not execute()")]
    DirectStreamViaExecute,

    #[error("invalid configuration for service '{service}': {reason}")]
    InvalidServiceSection { service: String, reason: String },
}

/// HTTP service error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Invalid configuration or call arguments
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// A request phase exceeded its deadline
    #[error("{phase} timeout after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Response body was not valid JSON; the raw text is logged, not returned
    #[error("Invalid JSON response format")]
    Decode,

    /// JSON parsing error from a fetch-style body helper
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-2xx response raised because the service throws on non-ok status
    #[error("HTTP {}", .0.status_code)]
    Status(Box<ResultEnvelope>),

    /// Writing into a direct-stream sink failed
    #[error("Stream sink failed: {0}")]
    Sink(#[source] std::io::Error),

    /// The transport has been closed
    #[error("Transport closed")]
    ServiceClosed,

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },
}

impl HttpError {
    /// Returns the envelope carried by a raised non-ok response.
    #[must_use]
    pub fn envelope(&self) -> Option<&ResultEnvelope> {
        match self {
            HttpError::Status(envelope) => Some(envelope),
            _ => None,
        }
    }

    /// Consumes the error, returning the raised envelope if there is one.
    ///
    /// # Errors
    /// Gives the error back unchanged when it is not [`HttpError::Status`].
    pub fn into_envelope(self) -> Result<ResultEnvelope, Self> {
        match self {
            HttpError::Status(envelope) => Ok(*envelope),
            other => Err(other),
        }
    }

    /// Unwraps a boxed body or tower error, keeping typed errors intact.
    pub(crate) fn from_boxed(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        match err.downcast::<HttpError>() {
            Ok(http_err) => *http_err,
            Err(other) => HttpError::Transport(other),
        }
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
