//! Transport selection: the shared default engine, or an owned engine bound
//! to one origin.

use crate::body::drain_into;
use crate::config::{ServiceConfig, TransportKind};
use crate::engine::{CallTimeouts, Engine, EngineSettings};
use crate::error::{ConfigError, HttpError, InvalidUriKind};
use crate::request::RequestDescriptor;
use crate::response::{FetchResponse, RawResponse, RequestContext, ResponseHead, StreamHandle};
use bytes::Bytes;
use http::header::USER_AGENT;
use http::{HeaderValue, Request, Uri};
use http_body_util::Full;
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// An owned engine and the origin it is bound to.
#[derive(Debug)]
pub struct BoundTransport {
    /// `scheme://authority`, no trailing slash
    origin: String,
    engine: Engine,
    user_agent: HeaderValue,
}

impl BoundTransport {
    fn build(
        service: &str,
        base_url: &str,
        settings: EngineSettings,
        user_agent: HeaderValue,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            origin: origin_of(service, base_url)?,
            engine: Engine::build(service, settings)?,
            user_agent,
        })
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// The transport a service issues its calls through.
#[derive(Debug)]
pub enum Transport {
    /// No owned engine; calls go to the shared default engine with
    /// fully-qualified URLs
    Absent {
        engine: Arc<Engine>,
        user_agent: HeaderValue,
    },
    /// One long-lived connection to a fixed origin
    PersistentClient(BoundTransport),
    /// Several concurrent connections to a fixed origin
    Pool(BoundTransport),
}

impl Transport {
    /// Builds the transport `config` selects. Absent transports borrow
    /// `default_engine`.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingBaseUrl` for a bound transport without an
    /// origin, `ConfigError::InvalidBaseUrl` when the origin does not parse,
    /// or an error if the engine cannot be built.
    pub fn build(
        service: &str,
        config: &ServiceConfig,
        default_engine: Arc<Engine>,
    ) -> Result<Self, HttpError> {
        config.validate(service)?;

        let user_agent = HeaderValue::from_str(&config.user_agent)?;
        let kind = config.transport_kind();
        let (Some(options), Some(base_url)) =
            (config.bound_transport_options(), config.base_url.as_deref())
        else {
            return Ok(Transport::Absent {
                engine: default_engine,
                user_agent,
            });
        };

        Ok(match kind {
            TransportKind::Pool => Transport::Pool(BoundTransport::build(
                service,
                base_url,
                EngineSettings::pool(options),
                user_agent,
            )?),
            _ => Transport::PersistentClient(BoundTransport::build(
                service,
                base_url,
                EngineSettings::persistent(options),
                user_agent,
            )?),
        })
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Absent { .. } => TransportKind::None,
            Transport::PersistentClient(_) => TransportKind::PersistentClient,
            Transport::Pool(_) => TransportKind::Pool,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        match self {
            Transport::Absent { engine, .. } => engine,
            Transport::PersistentClient(bound) | Transport::Pool(bound) => &bound.engine,
        }
    }

    /// Sent on every call that does not set its own `User-Agent`.
    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        match self {
            Transport::Absent { user_agent, .. } => user_agent,
            Transport::PersistentClient(bound) | Transport::Pool(bound) => &bound.user_agent,
        }
    }

    /// The URL a descriptor path is sent to.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` when the path cannot form an absolute
    /// URL for this transport.
    pub fn target(&self, path: &str) -> Result<Uri, HttpError> {
        match self {
            Transport::Absent { .. } => absolute_uri(path),
            Transport::PersistentClient(bound) | Transport::Pool(bound) => {
                if !path.starts_with('/') {
                    return Err(HttpError::InvalidUri {
                        url: path.to_owned(),
                        kind: InvalidUriKind::RelativePath,
                        reason: "path on a bound transport must start with '/'".to_owned(),
                    });
                }
                absolute_uri(&format!("{}{path}", bound.origin))
            }
        }
    }

    /// Issues one call and returns the response with its body unread.
    ///
    /// # Errors
    /// Returns the transport's failure unchanged.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<RawResponse, HttpError> {
        let uri = self.target(&descriptor.path)?;
        let context = RequestContext {
            method: descriptor.method.clone(),
            url: uri.to_string(),
            transport: self.kind(),
        };
        let timeouts = CallTimeouts {
            connect: descriptor.connect_timeout,
            headers: descriptor.headers_timeout,
            body: descriptor.body_timeout,
        };
        let opaque = descriptor.opaque.clone();

        let mut request = Request::builder()
            .method(descriptor.method)
            .uri(uri)
            .body(Full::new(descriptor.body.unwrap_or_else(Bytes::new)))?;
        *request.headers_mut() = descriptor.headers;
        request
            .headers_mut()
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent().clone());

        let response = self.engine().send(request, timeouts).await?;
        Ok(RawResponse::from_response(response, opaque, context))
    }

    /// Pipes the response body into the sink `factory` builds from the head,
    /// without materializing it.
    ///
    /// The sink is flushed and shut down once the body ends.
    ///
    /// # Errors
    /// Returns the transport's failure, or `HttpError::Sink` when writing
    /// into the sink fails.
    pub async fn stream_request<F, W>(
        &self,
        descriptor: RequestDescriptor,
        factory: F,
    ) -> Result<StreamHandle, HttpError>
    where
        F: FnOnce(&ResponseHead) -> W,
        W: AsyncWrite + Unpin + Send,
    {
        let RawResponse { head, body } = self.request(descriptor).await?;
        let mut sink = factory(&head);
        let (bytes_written, trailers) = drain_into(body, &mut sink).await?;
        Ok(StreamHandle {
            opaque: head.opaque,
            trailers,
            bytes_written,
        })
    }

    /// Issues one call and wraps the response fetch-style.
    ///
    /// # Errors
    /// Returns the transport's failure unchanged.
    pub async fn fetch_like(
        &self,
        descriptor: RequestDescriptor,
        max_body_size: usize,
    ) -> Result<FetchResponse, HttpError> {
        let RawResponse { head, body } = self.request(descriptor).await?;
        let mut inner = http::Response::new(body);
        *inner.status_mut() = head.status;
        *inner.headers_mut() = head.headers;
        Ok(FetchResponse {
            inner,
            max_body_size,
            context: head.context,
        })
    }

    /// Closes an owned engine, waiting for open bodies. A no-op for the
    /// absent transport: the default engine belongs to someone else.
    pub async fn close(&self) {
        match self {
            Transport::Absent { .. } => {}
            Transport::PersistentClient(bound) | Transport::Pool(bound) => {
                bound.engine.close().await;
            }
        }
    }
}

fn absolute_uri(url: &str) -> Result<Uri, HttpError> {
    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
        url: url.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;
    if uri.scheme().is_none() {
        return Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingScheme,
            reason: "URL has no scheme".to_owned(),
        });
    }
    if uri.authority().is_none() {
        return Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "URL has no host".to_owned(),
        });
    }
    Ok(uri)
}

/// `scheme://authority` of `base_url`; any path prefix is dropped.
fn origin_of(service: &str, base_url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
        service: service.to_owned(),
        url: base_url.to_owned(),
        reason: reason.to_owned(),
    };
    let uri: Uri = base_url.parse().map_err(|_| invalid("not a valid URL"))?;
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => Ok(format!("{scheme}://{authority}")),
        (None, _) => Err(invalid("missing scheme")),
        (_, None) => Err(invalid("missing host")),
    }
}
