//! The HTTP engine behind every transport: a hyper-util pooled client, a
//! connection limit that holds until each response body is released, and the
//! bookkeeping needed for a graceful close.

use crate::body::{Lease, ResponseBody, TrackedBody};
use crate::config::{TlsRootConfig, TransportOptions};
use crate::error::{HttpError, TimeoutPhase};
use crate::tls;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};

type ClientService = BoxCloneSyncService<Request<Full<Bytes>>, Response<Incoming>, HttpError>;

static SHARED_DEFAULT: OnceLock<Arc<Engine>> = OnceLock::new();

/// Engine-level connection and timeout policy.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub connect_timeout: Option<Duration>,
    pub headers_timeout: Option<Duration>,
    pub body_timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    /// Connections busy at once, counting responses whose body is still
    /// open (`None` = unbounded)
    pub max_connections: Option<usize>,
    pub max_idle_per_host: usize,
    pub tls_roots: TlsRootConfig,
}

impl Default for EngineSettings {
    /// Policy of the shared default engine.
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            headers_timeout: Some(Duration::from_secs(300)),
            body_timeout: Some(Duration::from_secs(300)),
            keep_alive_timeout: Some(Duration::from_secs(4)),
            max_connections: None,
            max_idle_per_host: usize::MAX,
            tls_roots: TlsRootConfig::WebPki,
        }
    }
}

impl EngineSettings {
    /// A single connection; calls wait for the previous body to be released.
    #[must_use]
    pub fn persistent(options: &TransportOptions) -> Self {
        Self {
            max_connections: Some(1),
            max_idle_per_host: 1,
            ..Self::bound(options)
        }
    }

    /// Up to `connections` concurrent connections (unbounded when unset).
    #[must_use]
    pub fn pool(options: &TransportOptions) -> Self {
        Self {
            max_connections: options.connections.map(|n| n.max(1)),
            max_idle_per_host: options.connections.unwrap_or(usize::MAX),
            ..Self::bound(options)
        }
    }

    fn bound(options: &TransportOptions) -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: options.connect_timeout.or(defaults.connect_timeout),
            headers_timeout: options.headers_timeout.or(defaults.headers_timeout),
            body_timeout: options.body_timeout.or(defaults.body_timeout),
            keep_alive_timeout: options.keep_alive_timeout.or(defaults.keep_alive_timeout),
            tls_roots: options.tls_roots,
            ..defaults
        }
    }
}

/// Per-call timeouts; unset fields fall back to the engine's settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTimeouts {
    pub connect: Option<Duration>,
    pub headers: Option<Duration>,
    pub body: Option<Duration>,
}

/// Connections are made inside the call, so a per-call connect timeout bounds
/// the whole pre-header phase whenever it is the tighter of the two.
fn pre_header_deadline(
    headers: Option<Duration>,
    connect: Option<Duration>,
) -> Option<(Duration, TimeoutPhase)> {
    match (headers, connect) {
        (Some(h), Some(c)) if c < h => Some((c, TimeoutPhase::Connect)),
        (Some(h), _) => Some((h, TimeoutPhase::Headers)),
        (None, Some(c)) => Some((c, TimeoutPhase::Connect)),
        (None, None) => None,
    }
}

/// A pooled HTTP client that can be closed gracefully.
///
/// Every response body handed out holds a token on the engine's task
/// tracker; [`Engine::close`] waits until all of them are released.
pub struct Engine {
    label: String,
    settings: EngineSettings,
    service: RwLock<Option<ClientService>>,
    connections: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("label", &self.label)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// # Errors
    /// Returns an error if TLS initialization fails.
    pub fn build(label: impl Into<String>, settings: EngineSettings) -> Result<Self, HttpError> {
        let https = tls::https_connector(settings.tls_roots, settings.connect_timeout)?;

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_timer is required for pool_idle_timeout to take effect
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(settings.max_idle_per_host);
        if let Some(idle) = settings.keep_alive_timeout {
            client_builder.pool_idle_timeout(idle);
        }
        let client = client_builder.build::<_, Full<Bytes>>(https);

        let service = BoxCloneSyncService::new(
            ServiceBuilder::new()
                .map_err(HttpError::from)
                .service(client),
        );
        let connections = settings
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));

        Ok(Self {
            label: label.into(),
            settings,
            service: RwLock::new(Some(service)),
            connections,
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The process-wide engine used by services without a bound transport.
    ///
    /// Created on first use. Services never close it; only its owner does.
    ///
    /// # Errors
    /// Returns an error if the engine cannot be built.
    pub fn shared_default() -> Result<Arc<Engine>, HttpError> {
        if let Some(engine) = SHARED_DEFAULT.get() {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(Engine::build("default", EngineSettings::default())?);
        Ok(Arc::clone(SHARED_DEFAULT.get_or_init(|| engine)))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends one request, enforcing header and body timeouts.
    ///
    /// On a bounded engine the call first waits for a connection slot; the
    /// slot travels with the response body.
    pub(crate) async fn send(
        &self,
        request: Request<Full<Bytes>>,
        timeouts: CallTimeouts,
    ) -> Result<Response<ResponseBody>, HttpError> {
        let service = self.service.read().clone().ok_or(HttpError::ServiceClosed)?;
        let permit = match &self.connections {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|_| HttpError::ServiceClosed)?,
            ),
            None => None,
        };
        let lease = Lease::new(self.tracker.token(), permit);

        let headers_timeout = timeouts.headers.or(self.settings.headers_timeout);
        let call = service.oneshot(request);
        let response = match pre_header_deadline(headers_timeout, timeouts.connect) {
            Some((after, phase)) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| HttpError::Timeout { phase, after })??,
            None => call.await?,
        };

        let body_timeout = timeouts.body.or(self.settings.body_timeout);
        Ok(response.map(|body| TrackedBody::new(body, body_timeout, lease).boxed()))
    }

    /// Stops accepting calls and waits for outstanding bodies to be released.
    ///
    /// Idempotent: later calls only wait.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.service.write().take();
            if let Some(connections) = &self.connections {
                connections.close();
            }
            self.tracker.close();
            tracing::debug!(
                engine = %self.label,
                in_flight = self.tracker.len(),
                "closing transport"
            );
        }
        self.tracker.wait().await;
    }
}
