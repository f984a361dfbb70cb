//! Per-name cache of service listings.
//!
//! The directory map and each entry have their own locks: creating an entry never
//! contends with swapping another entry's listing. Listings are immutable
//! [`Snapshot`]s, so readers clone an `Arc` and never see a half-written list.
//!
//! A name is populated on first read through a single-flight group, so any number of
//! concurrent first reads issue exactly one registry call. After that, reads are served
//! from the cache until the [`Refresher`](crate::Refresher) swaps in a newer listing;
//! reads never trigger a re-population, however stale the entry is.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::backend::Registry;
use crate::error::Result;
use crate::guard::CallGuard;
use crate::service::{Index, Service};
use crate::singleflight::SingleFlight;

/// Immutable listing of a service name at a given index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    services: Arc<[Service]>,
    index: Index,
}

impl Snapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(services: Vec<Service>, index: Index) -> Self {
        Self {
            services: services.into(),
            index,
        }
    }

    /// The services, in registry order.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Registry index the listing was observed at.
    #[must_use]
    pub fn index(&self) -> Index {
        self.index
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` when the listing has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns `true` once a registry answer has been stored.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.index != 0
    }
}

#[derive(Debug, Default)]
struct EntryState {
    snapshot: Snapshot,
    refreshed_at: Option<Instant>,
}

/// Cached listing plus freshness bookkeeping for one name.
#[derive(Debug)]
pub(crate) struct Entry {
    state: RwLock<EntryState>,
    /// Milliseconds since the directory epoch of the last read.
    touched: AtomicU64,
}

impl Entry {
    fn new(now: u64) -> Self {
        Self {
            state: RwLock::new(EntryState::default()),
            touched: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.touched.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.touched.load(Ordering::Relaxed))
    }

    pub(crate) async fn snapshot(&self) -> Snapshot {
        self.state.read().await.snapshot.clone()
    }

    async fn populated(&self) -> Option<Snapshot> {
        let state = self.state.read().await;
        state
            .snapshot
            .is_populated()
            .then(|| state.snapshot.clone())
    }

    async fn refreshed_at(&self) -> Option<Instant> {
        self.state.read().await.refreshed_at
    }

    /// Stores `snapshot` unless its index equals the current one. Returns whether the
    /// listing was replaced.
    async fn commit(&self, snapshot: Snapshot) -> bool {
        let mut state = self.state.write().await;
        state.refreshed_at = Some(Instant::now());

        if snapshot.index == state.snapshot.index {
            return false;
        }

        state.snapshot = snapshot;
        true
    }
}

/// Cache of service listings keyed by name.
pub struct Directory<R> {
    registry: Arc<R>,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    flights: SingleFlight<Snapshot>,
    guard: CallGuard,
    epoch: Instant,
}

impl<R: Registry> Directory<R> {
    pub(crate) fn new(registry: Arc<R>, guard: CallGuard) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            flights: SingleFlight::new(),
            guard,
            epoch: Instant::now(),
        }
    }

    /// Returns the cached listing for `name`, populating it on first use.
    ///
    /// # Errors
    ///
    /// Returns the registry error when the name has never been populated and the
    /// population call fails. The entry stays empty so the next caller retries.
    pub async fn fetch_service(&self, name: &str) -> Result<Snapshot> {
        let entry = self.entry(name).await;
        entry.touch(self.now());

        if let Some(snapshot) = entry.populated().await {
            return Ok(snapshot);
        }

        let flight = Self::populate(
            Arc::clone(&self.registry),
            self.guard.clone(),
            entry,
            name.to_string(),
        );

        self.flights.run(name, flight).await
    }

    async fn populate(
        registry: Arc<R>,
        guard: CallGuard,
        entry: Arc<Entry>,
        name: String,
    ) -> Result<Snapshot> {
        // Another flight may have finished between the caller's read and this one.
        if let Some(snapshot) = entry.populated().await {
            return Ok(snapshot);
        }

        let (services, index) = guard.run(registry.watch_service(&name, 0)).await?;
        tracing::debug!(
            service = %name,
            index,
            endpoints = services.len(),
            "populated directory entry"
        );

        let snapshot = Snapshot::new(services, index);
        entry.commit(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Names currently cached.
    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Number of cached names.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// When `name` was last validated against the registry, if it is cached and has
    /// been validated at all.
    pub async fn last_refresh(&self, name: &str) -> Option<Instant> {
        let entry = self.entries.read().await.get(name).map(Arc::clone)?;
        entry.refreshed_at().await
    }

    /// The registry behind this directory.
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub(crate) fn guard(&self) -> &CallGuard {
        &self.guard
    }

    /// Point-in-time copy of the map, taken under the read lock.
    pub(crate) async fn entries(&self) -> Vec<(String, Arc<Entry>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Re-validates one entry against the registry from its current index.
    ///
    /// Returns whether the listing changed. Errors leave the cached listing untouched.
    pub(crate) async fn refresh_entry(
        &self,
        name: &str,
        entry: &Entry,
        deadline: Option<Duration>,
    ) -> Result<bool> {
        let index = entry.snapshot().await.index();
        let (services, latest) = self
            .guard
            .with_deadline(deadline)
            .run(self.registry.watch_service(name, index))
            .await?;

        let changed = entry.commit(Snapshot::new(services, latest)).await;
        if changed {
            tracing::debug!(
                service = %name,
                from = index,
                to = latest,
                "refreshed directory entry"
            );
        }

        Ok(changed)
    }

    /// Drops entries not read for longer than `idle`. Returns how many were removed.
    ///
    /// Entries whose population is still in flight are kept, so the flight never commits
    /// into an entry the map no longer holds.
    pub(crate) async fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.now();
        let limit = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|name, entry| {
            let keep = entry.idle_for(now) <= limit || self.flights.is_pending(name);
            if !keep {
                tracing::debug!(service = %name, "evicting idle directory entry");
            }
            keep
        });

        before - entries.len()
    }

    async fn entry(&self, name: &str) -> Arc<Entry> {
        if let Some(entry) = self.entries.read().await.get(name) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().await;
        let now = self.now();
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Entry::new(now))),
        )
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::Error;
    use crate::testing::{MockRegistry, Reply};

    fn directory(registry: MockRegistry) -> Arc<Directory<MockRegistry>> {
        Arc::new(Directory::new(
            Arc::new(registry),
            CallGuard::new(CancellationToken::new(), Some(Duration::from_secs(5))),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_reads_populate_once() {
        let registry = MockRegistry::new().with_delay(Duration::from_millis(50));
        registry.set("api", Reply::of("api", &["10.0.0.1:80", "10.0.0.2:80"], 7));
        let directory = directory(registry);

        let readers: Vec<_> = (0..64)
            .map(|_| {
                let directory = Arc::clone(&directory);
                tokio::spawn(async move { directory.fetch_service("api").await })
            })
            .collect();

        for reader in readers {
            let snapshot = reader.await.unwrap().unwrap();
            assert_eq!(snapshot.len(), 2);
            assert_eq!(snapshot.index(), 7);
        }

        assert_eq!(directory.registry().calls(), vec![("api".to_string(), 0)]);
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn cached_reads_do_not_call_registry() {
        let registry = MockRegistry::new();
        registry.set("api", Reply::of("api", &["10.0.0.1:80"], 3));
        let directory = directory(registry);

        for _ in 0..5 {
            directory.fetch_service("api").await.unwrap();
        }

        assert_eq!(directory.registry().calls_for("api"), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_served_without_repopulation() {
        let registry = MockRegistry::new();
        registry.push("api", Reply::of("api", &["10.0.0.1:80"], 3));
        registry.set("api", Reply::of("api", &["10.0.0.9:80"], 4));
        let directory = directory(registry);

        directory.fetch_service("api").await.unwrap();
        // Well past any TTL a test would configure; nothing refreshes this directory.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = directory.fetch_service("api").await.unwrap();

        assert_eq!(snapshot.services()[0].address(), "10.0.0.1:80");
        assert_eq!(directory.registry().calls_for("api"), 1);
    }

    #[tokio::test]
    async fn failed_population_is_retried_by_next_reader() {
        let registry = MockRegistry::new();
        registry.push("api", Reply::Fail);
        registry.set("api", Reply::of("api", &["10.0.0.1:80"], 5));
        let directory = directory(registry);

        assert!(matches!(
            directory.fetch_service("api").await,
            Err(Error::Protocol(_))
        ));

        let snapshot = directory.fetch_service("api").await.unwrap();
        assert_eq!(snapshot.index(), 5);
        assert_eq!(directory.registry().calls_for("api"), 2);
    }

    #[tokio::test]
    async fn empty_listing_counts_as_populated() {
        let registry = MockRegistry::new();
        registry.set("api", Reply::of("api", &[], 9));
        let directory = directory(registry);

        assert!(directory.fetch_service("api").await.unwrap().is_empty());
        assert!(directory.fetch_service("api").await.unwrap().is_empty());
        assert_eq!(directory.registry().calls_for("api"), 1);
    }

    #[tokio::test]
    async fn population_respects_deadline() {
        let registry = MockRegistry::new();
        let directory = Directory::new(
            Arc::new(registry),
            CallGuard::new(CancellationToken::new(), Some(Duration::from_millis(20))),
        );

        assert!(matches!(
            directory.fetch_service("api").await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn refresh_swaps_only_on_new_index() {
        let registry = MockRegistry::new();
        registry.push("api", Reply::of("api", &["10.0.0.1:80"], 3));
        registry.push("api", Reply::of("api", &["10.0.0.2:80"], 3));
        registry.push("api", Reply::of("api", &["10.0.0.3:80"], 4));
        let directory = directory(registry);

        directory.fetch_service("api").await.unwrap();
        let (_, entry) = directory.entries().await.remove(0);

        assert!(!directory.refresh_entry("api", &entry, None).await.unwrap());
        assert_eq!(
            entry.snapshot().await.services()[0].address(),
            "10.0.0.1:80"
        );

        assert!(directory.refresh_entry("api", &entry, None).await.unwrap());
        assert_eq!(
            entry.snapshot().await.services()[0].address(),
            "10.0.0.3:80"
        );
        assert!(directory.last_refresh("api").await.is_some());
        assert_eq!(
            directory.registry().calls(),
            vec![
                ("api".to_string(), 0),
                ("api".to_string(), 3),
                ("api".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn refresh_failure_keeps_cached_listing() {
        let registry = MockRegistry::new();
        registry.push("api", Reply::of("api", &["10.0.0.1:80"], 3));
        registry.push("api", Reply::Fail);
        let directory = directory(registry);

        directory.fetch_service("api").await.unwrap();
        let (_, entry) = directory.entries().await.remove(0);

        assert!(directory.refresh_entry("api", &entry, None).await.is_err());
        assert_eq!(entry.snapshot().await.index(), 3);
    }

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        let registry = MockRegistry::new();
        registry.set("old", Reply::of("old", &["10.0.0.1:80"], 1));
        registry.set("new", Reply::of("new", &["10.0.0.2:80"], 1));
        let directory = directory(registry);

        directory.fetch_service("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        directory.fetch_service("new").await.unwrap();

        assert_eq!(directory.evict_idle(Duration::from_millis(30)).await, 1);
        assert_eq!(directory.names().await, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn entry_with_pending_population_is_not_evicted() {
        // No scripted reply: the population blocks.
        let directory = directory(MockRegistry::new());

        let reader = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.fetch_service("api").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(directory.evict_idle(Duration::ZERO).await, 0);
        assert_eq!(directory.names().await, vec!["api".to_string()]);

        reader.abort();
    }

    #[tokio::test]
    async fn cancelled_directory_fails_population() {
        let token = CancellationToken::new();
        let registry = MockRegistry::new();
        registry.set("api", Reply::of("api", &["10.0.0.1:80"], 1));
        let directory = Directory::new(Arc::new(registry), CallGuard::new(token.clone(), None));

        token.cancel();

        assert!(matches!(
            directory.fetch_service("api").await,
            Err(Error::Cancelled)
        ));
        assert!(directory.registry().calls().is_empty());
    }
}
