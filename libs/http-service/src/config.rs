use crate::error::{ConfigError, HttpError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default User-Agent string for outbound requests
pub const DEFAULT_USER_AGENT: &str = concat!("http-service/", env!("CARGO_PKG_VERSION"));

/// Default cap on bodies drained into memory (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Content type defaulted on `POST`/`PUT` requests
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// TLS root certificate source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots (`webpki-roots`)
    #[default]
    WebPki,
    /// Operating system certificate store
    Native,
}

/// Which transport a service owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// No owned transport; calls go through the shared default engine
    None,
    /// One long-lived connection to a fixed origin
    PersistentClient,
    /// Several concurrent connections to a fixed origin
    Pool,
}

impl TransportKind {
    /// A bound transport carries its own origin and timeout policy.
    #[must_use]
    pub fn is_bound(self) -> bool {
        !matches!(self, TransportKind::None)
    }
}

/// Tuning for a persistent client or a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// Maximum time to establish a connection
    #[serde(with = "crate::duration_serde::option")]
    pub connect_timeout: Option<Duration>,

    /// Maximum wait for the response head
    #[serde(with = "crate::duration_serde::option")]
    pub headers_timeout: Option<Duration>,

    /// Maximum idle time between two body chunks
    #[serde(with = "crate::duration_serde::option")]
    pub body_timeout: Option<Duration>,

    /// How long an idle connection is kept open
    #[serde(with = "crate::duration_serde::option")]
    pub keep_alive_timeout: Option<Duration>,

    /// Connection count for a pool (default: unbounded). A response whose
    /// body is still open keeps its connection counted.
    pub connections: Option<usize>,

    /// TLS root certificate strategy
    pub tls_roots: TlsRootConfig,
}

/// Connect sub-options of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectOptions {
    #[serde(with = "crate::duration_serde::option")]
    pub timeout: Option<Duration>,
}

/// Caller-supplied partial request options.
///
/// Every field is optional; [`ServiceConfig::default_request_options`] fills
/// the gaps the caller leaves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
    /// HTTP method (default: `GET`)
    pub method: Option<String>,

    /// Request headers; names are matched case-insensitively
    pub headers: BTreeMap<String, String>,

    /// Pre-encoded request body
    #[serde(skip)]
    pub body: Option<bytes::Bytes>,

    /// Single timeout alias, fanned out into the connect, headers and body
    /// timeouts when the service has no bound transport
    #[serde(with = "crate::duration_serde::option")]
    pub timeout: Option<Duration>,

    #[serde(with = "crate::duration_serde::option")]
    pub headers_timeout: Option<Duration>,

    #[serde(with = "crate::duration_serde::option")]
    pub body_timeout: Option<Duration>,

    pub connect: Option<ConnectOptions>,

    /// Token echoed back untouched on the result
    pub opaque: Option<serde_json::Value>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<bytes::Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn opaque(mut self, opaque: serde_json::Value) -> Self {
        self.opaque = Some(opaque);
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Fills every field the caller left unset from `defaults`.
    ///
    /// Headers are not inherited: a service has no header defaults.
    #[must_use]
    pub fn or_defaults(self, defaults: &RequestOptions) -> Self {
        Self {
            method: self.method.or_else(|| defaults.method.clone()),
            headers: self.headers,
            body: self.body.or_else(|| defaults.body.clone()),
            timeout: self.timeout.or(defaults.timeout),
            headers_timeout: self.headers_timeout.or(defaults.headers_timeout),
            body_timeout: self.body_timeout.or(defaults.body_timeout),
            connect: self.connect.or_else(|| defaults.connect.clone()),
            opaque: self.opaque.or_else(|| defaults.opaque.clone()),
        }
    }
}

/// Configuration of one named service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Origin (and optional path prefix) prepended to relative paths
    pub base_url: Option<String>,

    /// Header that carries the caller's correlation identifier
    pub correlation_header_name: Option<String>,

    /// Build a persistent client bound to `base_url`
    pub transport_options: Option<TransportOptions>,

    /// Build a connection pool bound to `base_url`
    pub pool_options: Option<TransportOptions>,

    /// Fallback values for fields the caller leaves unset.
    ///
    /// The caller's options win field by field; these never override a value
    /// the caller set, and headers are not inherited.
    pub default_request_options: RequestOptions,

    /// Raise non-2xx envelopes as [`HttpError::Status`]
    pub throw_on_non_ok: bool,

    pub suppress_debug_log: bool,

    pub suppress_info_log: bool,

    /// Also expand the single `timeout` alias when a bound transport exists
    pub alias_timeout_on_bound_transport: bool,

    /// Cap on bodies drained into memory
    pub max_body_size: usize,

    /// User-Agent sent when the caller sets none
    pub user_agent: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            correlation_header_name: None,
            transport_options: None,
            pool_options: None,
            default_request_options: RequestOptions::default(),
            throw_on_non_ok: false,
            suppress_debug_log: false,
            suppress_info_log: false,
            alias_timeout_on_bound_transport: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl ServiceConfig {
    /// Service with a base URL and otherwise default settings.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// The transport kind these options select. Pool options win over
    /// persistent-client options.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        if self.pool_options.is_some() {
            TransportKind::Pool
        } else if self.transport_options.is_some() {
            TransportKind::PersistentClient
        } else {
            TransportKind::None
        }
    }

    /// Options of the selected bound transport, if any.
    #[must_use]
    pub fn bound_transport_options(&self) -> Option<&TransportOptions> {
        self.pool_options
            .as_ref()
            .or(self.transport_options.as_ref())
    }

    /// Checks construction-time invariants.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingBaseUrl` when a bound transport is
    /// configured without an origin.
    pub fn validate(&self, service: &str) -> Result<(), ConfigError> {
        if self.transport_kind().is_bound() && self.base_url.is_none() {
            return Err(ConfigError::MissingBaseUrl {
                service: service.to_owned(),
            });
        }
        if self.transport_options.is_some() && self.pool_options.is_some() {
            tracing::warn!(
                service,
                "both transport_options and pool_options set; building a pool"
            );
        }
        Ok(())
    }

    /// Parses one service section.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidServiceSection` when the section does not
    /// match the expected shape.
    pub fn from_value(service: &str, value: &serde_json::Value) -> Result<Self, HttpError> {
        serde_json::from_value(value.clone()).map_err(|e| {
            ConfigError::InvalidServiceSection {
                service: service.to_owned(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}
