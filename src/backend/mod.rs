//! Registry backends.
//!
//! A [`Registry`] answers four questions about the service directory: register an
//! instance, deregister it, list the instances of a name, and block until that list
//! changes. [`Backend`] is the concrete variant a [`Center`](crate::Center) talks to; it
//! is chosen once from [`CenterConfig`] and never inspected again.

mod consul;
mod static_table;

use std::future::Future;

pub use consul::ConsulRegistry;
pub use static_table::StaticRegistry;

use crate::config::CenterConfig;
use crate::error::{Error, Result};
use crate::service::{Check, Index, Service};

/// Services and the index they were observed at.
pub type Listing = (Vec<Service>, Index);

/// Capability set of a service registry.
pub trait Registry: Send + Sync + 'static {
    /// Registers an instance, with an optional health check.
    fn register(
        &self,
        service: &Service,
        check: Option<&Check>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Removes a registered instance.
    fn deregister(&self, service_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Lists the healthy instances of `name` without blocking.
    fn fetch_service(&self, name: &str) -> impl Future<Output = Result<Listing>> + Send;

    /// Long-polls `name`.
    ///
    /// With `index == 0` this returns the current listing at once. Otherwise it returns
    /// when the registry reports a change past `index` or its own wait elapses, in which
    /// case the listing may be unchanged.
    fn watch_service(
        &self,
        name: &str,
        index: Index,
    ) -> impl Future<Output = Result<Listing>> + Send;

    /// Whether listings can change after the first answer. Backends that never change
    /// are not refreshed in the background.
    fn is_dynamic(&self) -> bool {
        true
    }
}

/// The registry variant selected from configuration.
#[derive(Debug)]
pub enum Backend {
    /// Remote Consul agent.
    Consul(ConsulRegistry),
    /// In-memory table from the `service` configuration option.
    Static(StaticRegistry),
    /// No usable registry; every call fails with [`Error::InvalidBackend`].
    Unconfigured(String),
}

impl Backend {
    /// Selects and initializes the backend described by `config`.
    ///
    /// A remote agent that cannot be reached yields [`Backend::Unconfigured`] rather than
    /// an error, so callers observe the failure on every operation.
    ///
    /// # Errors
    ///
    /// Returns an error when the static table holds an invalid address, the registry
    /// address is not a URL, or the HTTP client cannot be built.
    pub async fn connect(config: &CenterConfig) -> Result<Self> {
        if config.is_static() {
            return Ok(Self::Static(StaticRegistry::new(&config.service)?));
        }

        if config.is_disabled() {
            tracing::debug!("registry disabled by address {:?}", config.address);
            return Ok(Self::Unconfigured(format!(
                "registry disabled by address `{}`",
                config.address
            )));
        }

        let consul = ConsulRegistry::new(
            &config.registry_url(),
            config.call_timeout(),
            config.wait_period(),
        )?;

        match consul.ping().await {
            Ok(()) => Ok(Self::Consul(consul)),
            Err(e) => {
                tracing::error!("registry agent {} unreachable: {e}", consul.base_url());
                Ok(Self::Unconfigured(format!(
                    "registry agent {} unreachable: {e}",
                    consul.base_url()
                )))
            }
        }
    }

    fn invalid(reason: &str) -> Error {
        Error::InvalidBackend(reason.to_string())
    }
}

impl Registry for Backend {
    async fn register(&self, service: &Service, check: Option<&Check>) -> Result<()> {
        match self {
            Self::Consul(c) => c.register(service, check).await,
            Self::Static(s) => s.register(service, check).await,
            Self::Unconfigured(reason) => Err(Self::invalid(reason)),
        }
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        match self {
            Self::Consul(c) => c.deregister(service_id).await,
            Self::Static(s) => s.deregister(service_id).await,
            Self::Unconfigured(reason) => Err(Self::invalid(reason)),
        }
    }

    async fn fetch_service(&self, name: &str) -> Result<Listing> {
        match self {
            Self::Consul(c) => c.fetch_service(name).await,
            Self::Static(s) => s.fetch_service(name).await,
            Self::Unconfigured(reason) => Err(Self::invalid(reason)),
        }
    }

    async fn watch_service(&self, name: &str, index: Index) -> Result<Listing> {
        match self {
            Self::Consul(c) => c.watch_service(name, index).await,
            Self::Static(s) => s.watch_service(name, index).await,
            Self::Unconfigured(reason) => Err(Self::invalid(reason)),
        }
    }

    fn is_dynamic(&self) -> bool {
        matches!(self, Self::Consul(_))
    }
}
