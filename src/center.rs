//! The consumer-facing handle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Listing, Registry};
use crate::config::CenterConfig;
use crate::directory::{Directory, Snapshot};
use crate::error::Result;
use crate::guard::CallGuard;
use crate::refresh::{RefreshOptions, Refresher};
use crate::selector::{RoundRobin, pick_by_key};
use crate::service::{Check, Index, Service};
use crate::watcher::Watcher;

/// Owns the registry, the directory cache, its refresher and the round-robin counter.
///
/// Every operation is cancelled when the center shuts down or is dropped; watchers created
/// by [`watch`](Self::watch) close at the same moment.
///
/// # Example
///
/// ```ignore
/// use service_center::{Center, CenterConfig};
///
/// let center = Center::setup(&CenterConfig::new("10.0.0.5:8500")).await?;
///
/// if let Some(service) = center.robin("billing.grpc").await? {
///     println!("calling {}", service.address());
/// }
///
/// center.shutdown().await;
/// ```
pub struct Center<R: Registry = Backend> {
    registry: Arc<R>,
    directory: Arc<Directory<R>>,
    selector: RoundRobin,
    refresher: Option<Refresher>,
    guard: CallGuard,
}

impl Center<Backend> {
    /// Connects the backend described by `config` and starts the refresher when the
    /// backend can change.
    ///
    /// # Errors
    ///
    /// Returns an error when the static table holds an invalid address or the HTTP client
    /// cannot be built. An unreachable agent is not an error here; see
    /// [`Backend::connect`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub async fn setup(config: &CenterConfig) -> Result<Self> {
        let backend = Backend::connect(config).await?;
        Ok(Self::with_registry(backend, config))
    }
}

impl<R: Registry> Center<R> {
    /// Builds a center on top of an already constructed registry.
    ///
    /// # Panics
    ///
    /// Panics when the refresher has to be started outside a tokio runtime.
    #[must_use]
    pub fn with_registry(registry: R, config: &CenterConfig) -> Self {
        let registry = Arc::new(registry);
        let guard = CallGuard::new(CancellationToken::new(), config.call_timeout());
        let directory = Arc::new(Directory::new(Arc::clone(&registry), guard.clone()));

        let refresher = match config.ttl_period() {
            Some(period) if registry.is_dynamic() => {
                let mut options = RefreshOptions::new(period, config.refresh_tasks());
                if let Some(idle) = config.idle_period() {
                    options = options.idle(idle);
                }
                Some(Refresher::start(Arc::clone(&directory), options))
            }
            Some(_) => {
                tracing::debug!("registry never changes, directory refresh disabled");
                None
            }
            None => {
                tracing::debug!("ttl is zero, directory refresh disabled");
                None
            }
        };

        Self {
            registry,
            directory,
            selector: RoundRobin::new(),
            refresher,
            guard,
        }
    }

    /// Registers `service` with the registry, with an optional health check.
    ///
    /// # Errors
    ///
    /// Returns the registry error, [`Error::Timeout`](crate::Error::Timeout) past the
    /// configured deadline, or [`Error::Cancelled`](crate::Error::Cancelled) after
    /// shutdown.
    pub async fn register(&self, service: &Service, check: Option<&Check>) -> Result<()> {
        self.guard.run(self.registry.register(service, check)).await?;
        tracing::debug!(service = %service, id = service.id(), "registered service");
        Ok(())
    }

    /// Removes the registration with the given id.
    ///
    /// # Errors
    ///
    /// Fails like [`register`](Self::register).
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        self.guard.run(self.registry.deregister(service_id)).await?;
        tracing::debug!(id = service_id, "deregistered service");
        Ok(())
    }

    /// Cached listing of `name`, populated on first use.
    ///
    /// # Errors
    ///
    /// Returns the population error when `name` has never been fetched successfully.
    pub async fn fetch_service(&self, name: &str) -> Result<Snapshot> {
        self.directory.fetch_service(name).await
    }

    /// Blocking query straight to the registry, bypassing the cache.
    ///
    /// With `index == 0` the call returns immediately; otherwise it blocks until the
    /// registry index moves past `index` or the registry's own wait elapses.
    ///
    /// # Errors
    ///
    /// Returns the registry error or [`Error::Cancelled`](crate::Error::Cancelled) after
    /// shutdown.
    pub async fn watch_service(&self, name: &str, index: Index) -> Result<Listing> {
        self.guard
            .with_deadline(None)
            .run(self.registry.watch_service(name, index))
            .await
    }

    /// Next service of `name` in round-robin order, or `None` when the listing is empty.
    ///
    /// The counter is shared by every name this center serves.
    ///
    /// # Errors
    ///
    /// Fails like [`fetch_service`](Self::fetch_service).
    pub async fn robin(&self, name: &str) -> Result<Option<Service>> {
        let snapshot = self.fetch_service(name).await?;
        Ok(self.selector.pick(snapshot.services()).cloned())
    }

    /// Service of `name` that `key` routes to, or `None` when the listing is empty.
    ///
    /// # Errors
    ///
    /// Fails like [`fetch_service`](Self::fetch_service).
    pub async fn hash(&self, name: &str, key: &str) -> Result<Option<Service>> {
        let snapshot = self.fetch_service(name).await?;
        Ok(pick_by_key(snapshot.services(), key).cloned())
    }

    /// Creates a watcher for `name`. It closes on its own or when this center shuts down.
    #[must_use]
    pub fn watch(&self, name: &str) -> Watcher<R> {
        Watcher::new(name, Arc::clone(&self.registry), self.guard.token())
    }

    /// The directory cache.
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory<R>> {
        &self.directory
    }

    /// The registry backend.
    #[must_use]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Returns `true` while the background refresher runs.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refresher.as_ref().is_some_and(Refresher::is_running)
    }

    /// Cancels in-flight calls, closes watchers and waits for the refresher to stop.
    pub async fn shutdown(mut self) {
        self.guard.token().cancel();

        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }

        tracing::debug!("service center shut down");
    }
}

impl<R: Registry> Drop for Center<R> {
    fn drop(&mut self) {
        self.guard.token().cancel();
    }
}
