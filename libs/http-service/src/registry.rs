use crate::config::ServiceConfig;
use crate::engine::{Engine, EngineSettings};
use crate::error::{ConfigError, HttpError};
use crate::service::HttpService;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Named services built from one configuration map.
///
/// Services without a bound transport share a default engine owned by the
/// registry; [`shutdown`](Self::shutdown) closes it exactly once.
#[derive(Debug)]
pub struct HttpServiceRegistry {
    services: BTreeMap<String, Arc<HttpService>>,
    default_engine: Arc<Engine>,
    default_closed: AtomicBool,
}

impl HttpServiceRegistry {
    /// # Errors
    /// Fails on the first service whose configuration is rejected.
    pub fn from_config(configs: BTreeMap<String, ServiceConfig>) -> Result<Self, HttpError> {
        let default_engine = Arc::new(Engine::build("default", EngineSettings::default())?);
        let services = configs
            .into_iter()
            .map(|(name, config)| {
                let service =
                    HttpService::with_default_engine(name.clone(), config, Arc::clone(&default_engine))?;
                Ok((name, Arc::new(service)))
            })
            .collect::<Result<BTreeMap<_, _>, HttpError>>()?;

        tracing::info!(services = services.len(), "http services registered");
        Ok(Self {
            services,
            default_engine,
            default_closed: AtomicBool::new(false),
        })
    }

    /// Parses a JSON object mapping service names to service sections.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidServiceSection` when `value` is not an
    /// object or a section does not parse, otherwise as
    /// [`from_config`](Self::from_config).
    pub fn from_value(value: &serde_json::Value) -> Result<Self, HttpError> {
        let Some(sections) = value.as_object() else {
            return Err(ConfigError::InvalidServiceSection {
                service: "*".to_owned(),
                reason: "expected an object of named services".to_owned(),
            }
            .into());
        };
        let configs = sections
            .iter()
            .map(|(name, section)| Ok((name.clone(), ServiceConfig::from_value(name, section)?)))
            .collect::<Result<BTreeMap<_, _>, HttpError>>()?;
        Self::from_config(configs)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<HttpService>> {
        self.services.get(name).cloned()
    }

    #[must_use]
    pub fn services(&self) -> &BTreeMap<String, Arc<HttpService>> {
        &self.services
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    #[must_use]
    pub fn default_engine(&self) -> &Arc<Engine> {
        &self.default_engine
    }

    /// Closes every owned transport, then the shared default engine once,
    /// waiting for open bodies.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.services.values().map(|service| service.close())).await;
        if !self.default_closed.swap(true, Ordering::AcqRel) {
            self.default_engine.close().await;
        }
        tracing::info!("http services shut down");
    }
}
