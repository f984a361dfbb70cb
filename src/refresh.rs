//! Background re-validation of cached entries.
//!
//! Every tick snapshots the directory's names, splits them round-robin into at most
//! `tasks` buckets and refreshes each bucket sequentially on its own task. A failure or
//! panic while refreshing one name is logged and contained; it never stops the other
//! names of the bucket or the other buckets.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::Registry;
use crate::directory::Directory;
use crate::error::Error;

/// Refresher settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Tick period. Every bucket of a tick must also finish within one period.
    pub period: Duration,
    /// Maximum number of concurrent refresh tasks.
    pub tasks: usize,
    /// Evict entries idle for longer than this before each tick.
    pub idle: Option<Duration>,
}

impl RefreshOptions {
    /// Creates options with the given period and concurrency, without idle eviction.
    #[must_use]
    pub fn new(period: Duration, tasks: usize) -> Self {
        Self {
            period,
            tasks,
            idle: None,
        }
    }

    /// Enables idle eviction.
    #[must_use]
    pub fn idle(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }
}

/// Outcome counters of one refresh tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Entries whose listing was replaced.
    pub changed: usize,
    /// Entries validated without change, including long-polls that hit the deadline.
    pub unchanged: usize,
    /// Entries whose refresh failed or panicked.
    pub failed: usize,
}

impl TickSummary {
    fn merge(&mut self, other: Self) {
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// Handle to a running background refresher. Dropping it stops the task.
#[derive(Debug)]
pub struct Refresher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Refresher {
    /// Spawns the refresh loop for `directory`.
    ///
    /// The loop also stops when the directory's owning center shuts down.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn start<R: Registry>(directory: Arc<Directory<R>>, options: RefreshOptions) -> Self {
        let cancel = directory.guard().token().child_token();
        let handle = tokio::spawn(refresh_loop(directory, options, cancel.clone()));

        tracing::debug!(
            "started directory refresher every {:?} with {} tasks",
            options.period,
            options.tasks
        );

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Returns `true` while the loop has not been asked to stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the loop and waits for it, aborting any in-flight refresh.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("directory refresher terminated abnormally: {e}");
            }
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refresh_loop<R: Registry>(
    directory: Arc<Directory<R>>,
    options: RefreshOptions,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + options.period, options.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(idle) = options.idle {
            let evicted = directory.evict_idle(idle).await;
            if evicted > 0 {
                tracing::debug!("evicted {evicted} idle directory entries");
            }
        }

        let summary = tokio::select! {
            () = cancel.cancelled() => break,
            summary = refresh_entries(&directory, options.tasks, Some(options.period)) => summary,
        };

        tracing::debug!(
            changed = summary.changed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "directory refresh tick complete"
        );
    }

    tracing::debug!("directory refresher stopped");
}

/// Refreshes every cached entry once, using at most `tasks` concurrent tasks.
///
/// With a `budget`, each bucket must finish within it: the budget is split evenly across
/// the bucket's names and bounds each registry call. A call that hits its share counts as
/// unchanged. Cached listings are only ever replaced by successful answers.
pub async fn refresh_entries<R: Registry>(
    directory: &Arc<Directory<R>>,
    tasks: usize,
    budget: Option<Duration>,
) -> TickSummary {
    let buckets = partition(directory.entries().await, tasks);
    let mut set = JoinSet::new();

    for bucket in buckets {
        let directory = Arc::clone(directory);
        let deadline = budget.map(|budget| share(budget, bucket.len()));

        set.spawn(async move {
            let mut summary = TickSummary::default();

            for (name, entry) in bucket {
                let refresh = directory.refresh_entry(&name, &entry, deadline);

                match AssertUnwindSafe(refresh).catch_unwind().await {
                    Ok(Ok(true)) => summary.changed += 1,
                    Ok(Ok(false)) => summary.unchanged += 1,
                    Ok(Err(Error::Timeout(_))) => {
                        tracing::trace!(service = %name, "no change within refresh deadline");
                        summary.unchanged += 1;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            service = %name,
                            "refresh failed, keeping cached listing: {e}"
                        );
                        summary.failed += 1;
                    }
                    Err(panic) => {
                        tracing::error!(
                            service = %name,
                            "refresh panicked, keeping cached listing: {}",
                            panic_message(panic.as_ref())
                        );
                        summary.failed += 1;
                    }
                }
            }

            summary
        });
    }

    let mut total = TickSummary::default();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(summary) => total.merge(summary),
            Err(e) => tracing::error!("refresh task failed: {e}"),
        }
    }

    total
}

/// One name's slice of a bucket budget.
fn share(budget: Duration, names: usize) -> Duration {
    budget / u32::try_from(names.max(1)).unwrap_or(u32::MAX)
}

/// Splits `items` round-robin into `min(len, buckets)` non-empty buckets.
fn partition<T>(items: Vec<T>, buckets: usize) -> Vec<Vec<T>> {
    let count = buckets.max(1).min(items.len());
    let mut parts: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();

    for (i, item) in items.into_iter().enumerate() {
        parts[i % count].push(item);
    }

    parts
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
