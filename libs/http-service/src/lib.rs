#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Named outbound HTTP services
//!
//! Each [`HttpService`] issues requests through one of three transports:
//! - the process-wide default engine, with fully-qualified URLs
//! - a persistent client bound to one origin
//! - a connection pool bound to one origin
//!
//! Calls are normalized against the service configuration (base URL,
//! timeout alias, default `Content-Type`, correlation header) and responses
//! are decoded per [`OutputMode`] into a [`ResultEnvelope`]:
//! JSON, text, lazily decoded text or JSON streams, or the raw response.
//!
//! # Example
//!
//! ```ignore
//! use http_service::{HttpService, OutputMode, RequestOptions, ServiceConfig};
//! use serde_json::json;
//!
//! let config = ServiceConfig {
//!     correlation_header_name: Some("x-request-id".to_owned()),
//!     throw_on_non_ok: true,
//!     ..ServiceConfig::with_base_url("http://localhost:8006/api/")
//! };
//! let users = HttpService::new("users", config)?;
//!
//! let created = users
//!     .post("users", json!({"name": "x"}), RequestOptions::new(), OutputMode::Json, Some("req-1"), None)
//!     .await?
//!     .into_envelope();
//! ```
//!
//! A [`HttpServiceRegistry`] builds services from a map of named sections and
//! closes every transport on [`shutdown`](HttpServiceRegistry::shutdown).

mod body;
mod config;
pub mod duration_serde;
mod engine;
mod error;
mod json_stream;
mod materialize;
mod mode;
mod registry;
mod request;
mod response;
mod service;
mod tls;
mod transport;

pub use body::{BoxError, Drained, LimitedBody, ResponseBody, drain};
pub use config::{
    ConnectOptions, DEFAULT_MAX_BODY_SIZE, DEFAULT_USER_AGENT, JSON_CONTENT_TYPE, RequestOptions,
    ServiceConfig, TlsRootConfig, TransportKind, TransportOptions,
};
pub use engine::{CallTimeouts, Engine, EngineSettings};
pub use error::{ConfigError, HttpError, InvalidUriKind, TimeoutPhase};
pub use json_stream::{JsonScanner, ScanError, StreamFilter};
pub use materialize::{JsonStream, TextStream};
pub use mode::OutputMode;
pub use registry::HttpServiceRegistry;
pub use request::{Normalizer, Payload, RequestDescriptor};
pub use response::{
    DecodedBody, FetchResponse, Output, RawResponse, RequestContext, ResponseHead,
    ResultEnvelope, StreamHandle, is_ok_status,
};
pub use service::HttpService;
pub use transport::{BoundTransport, Transport};
