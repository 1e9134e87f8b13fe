use crate::config::{RequestOptions, ServiceConfig};
use crate::engine::Engine;
use crate::error::{ConfigError, HttpError};
use crate::json_stream::StreamFilter;
use crate::materialize::{DecodeContext, materialize};
use crate::mode::OutputMode;
use crate::request::{Normalizer, Payload, with_payload};
use crate::response::{FetchResponse, Output, ResponseHead, StreamHandle};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Outbound HTTP facade for one named service.
///
/// Owns its transport, normalizes every call against the service
/// configuration and decodes responses per [`OutputMode`].
///
/// # Example
///
/// ```ignore
/// use http_service::{HttpService, OutputMode, RequestOptions, ServiceConfig};
///
/// let users = HttpService::new("users", ServiceConfig::with_base_url("http://h:8006/api/"))?;
/// let envelope = users
///     .get("users", RequestOptions::new(), OutputMode::Json, None, None)
///     .await?
///     .into_envelope();
/// ```
#[derive(Debug)]
pub struct HttpService {
    name: String,
    config: ServiceConfig,
    normalizer: Normalizer,
    transport: Transport,
}

impl HttpService {
    /// Builds a service; calls without a bound transport use the process-wide
    /// default engine.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an inconsistent configuration, or an
    /// error if the transport cannot be built.
    pub fn new(name: impl Into<String>, config: ServiceConfig) -> Result<Self, HttpError> {
        Self::with_default_engine(name, config, Engine::shared_default()?)
    }

    /// Builds a service whose absent transport goes through `default_engine`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an inconsistent configuration, or an
    /// error if the transport cannot be built.
    pub fn with_default_engine(
        name: impl Into<String>,
        config: ServiceConfig,
        default_engine: Arc<Engine>,
    ) -> Result<Self, HttpError> {
        let name = name.into();
        let normalizer = Normalizer::from_config(&name, &config)?;
        let transport = Transport::build(&name, &config, default_engine)?;
        tracing::debug!(service = %name, transport = ?transport.kind(), "http service ready");
        Ok(Self {
            name,
            config,
            normalizer,
            transport,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Runs one call: normalize, dispatch, decode per `mode`, then apply the
    /// non-ok policy.
    ///
    /// `fullResponse` returns the transport's raw response, unchecked.
    ///
    /// # Errors
    /// - [`ConfigError`] before any network activity: `directStream` (use
    ///   [`stream`](Self::stream)), `jsonStream` without a valid filter.
    /// - Transport failures, unchanged.
    /// - [`HttpError::Decode`] for a malformed JSON body.
    /// - [`HttpError::Status`] carrying the envelope when the service throws
    ///   on non-ok responses.
    pub async fn execute(
        &self,
        path: &str,
        options: RequestOptions,
        mode: OutputMode,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        let filter = match mode {
            OutputMode::DirectStream => return Err(ConfigError::DirectStreamViaExecute.into()),
            OutputMode::JsonStream => Some(
                stream_filter
                    .ok_or(ConfigError::MissingStreamFilter)?
                    .parse::<StreamFilter>()?,
            ),
            _ => None,
        };

        let descriptor = self.normalizer.normalize(path, options, correlation_id)?;
        if !self.config.suppress_info_log {
            tracing::info!(
                service = %self.name,
                method = %descriptor.method,
                path = %descriptor.path,
                correlation_id = correlation_id.unwrap_or_default(),
                "request"
            );
        }

        let raw = self.transport.request(descriptor).await?;
        let output = materialize(
            raw,
            mode,
            filter,
            DecodeContext {
                service: &self.name,
                max_body_size: self.config.max_body_size,
            },
        )
        .await?;

        let Output::Envelope(envelope) = output else {
            return Ok(output);
        };
        if !self.config.suppress_debug_log {
            tracing::debug!(service = %self.name, body = ?envelope.body, "Body returned");
        }
        if self.config.throw_on_non_ok && !envelope.ok {
            return Err(HttpError::Status(Box::new(envelope)));
        }
        Ok(Output::Envelope(envelope))
    }

    /// [`execute`](Self::execute) with the mode given by name.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidOutputMode` for an unknown name, before
    /// any network activity; otherwise as [`execute`](Self::execute).
    pub async fn execute_with_mode_str(
        &self,
        path: &str,
        options: RequestOptions,
        mode: &str,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        let mode: OutputMode = mode.parse()?;
        self.execute(path, options, mode, correlation_id, stream_filter)
            .await
    }

    /// Pipes the response body into the sink `factory` builds from the
    /// response head, bypassing output modes and request defaults.
    ///
    /// # Errors
    /// Returns transport failures unchanged, or `HttpError::Sink` when the
    /// sink fails.
    pub async fn stream<F, W>(
        &self,
        path: &str,
        options: RequestOptions,
        factory: F,
    ) -> Result<StreamHandle, HttpError>
    where
        F: FnOnce(&ResponseHead) -> W,
        W: AsyncWrite + Unpin + Send,
    {
        let descriptor = self.normalizer.passthrough(path, options)?;
        self.transport.stream_request(descriptor, factory).await
    }

    /// Fetch-style call; the response body is left for the caller to read.
    ///
    /// # Errors
    /// Returns transport failures unchanged.
    pub async fn fetch_like(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<FetchResponse, HttpError> {
        let descriptor = self.normalizer.passthrough(path, options)?;
        self.transport
            .fetch_like(descriptor, self.config.max_body_size)
            .await
    }

    /// `GET` shortcut.
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub async fn get(
        &self,
        path: &str,
        mut options: RequestOptions,
        mode: OutputMode,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        options.method.get_or_insert_with(|| "GET".to_owned());
        self.execute(path, options, mode, correlation_id, stream_filter)
            .await
    }

    /// `POST` shortcut. The payload is sent as JSON unless the options carry
    /// a non-JSON `Content-Type`.
    ///
    /// # Errors
    /// Returns `ConfigError::NullBody` for a JSON `null` payload, before any
    /// network activity; otherwise as [`execute`](Self::execute).
    pub async fn post(
        &self,
        path: &str,
        body: impl Into<Payload>,
        options: RequestOptions,
        mode: OutputMode,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        let body = body.into();
        if body == Payload::Json(serde_json::Value::Null) {
            return Err(ConfigError::NullBody.into());
        }
        let options = with_payload(options, "POST", body)?;
        self.execute(path, options, mode, correlation_id, stream_filter)
            .await
    }

    /// `PUT` shortcut, encoded like [`post`](Self::post). A `null` payload is
    /// sent as the JSON text `null`.
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub async fn put(
        &self,
        path: &str,
        body: impl Into<Payload>,
        options: RequestOptions,
        mode: OutputMode,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        let options = with_payload(options, "PUT", body.into())?;
        self.execute(path, options, mode, correlation_id, stream_filter)
            .await
    }

    /// `DELETE` shortcut.
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub async fn delete(
        &self,
        path: &str,
        mut options: RequestOptions,
        mode: OutputMode,
        correlation_id: Option<&str>,
        stream_filter: Option<&str>,
    ) -> Result<Output, HttpError> {
        options.method.get_or_insert_with(|| "DELETE".to_owned());
        self.execute(path, options, mode, correlation_id, stream_filter)
            .await
    }

    /// Closes the owned transport, waiting for open bodies. Idempotent; a
    /// no-op when the service has no bound transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}
