//! Incremental add/delete feed for one service name.
//!
//! A [`Watcher`] long-polls the registry directly, not the directory cache, and turns
//! successive listings into the set difference a connection pool needs. Listings that
//! bump the index without changing membership are absorbed: the watcher re-blocks on
//! the new index instead of returning an empty batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::backend::Registry;
use crate::error::{Error, Result};
use crate::guard::CallGuard;
use crate::service::Index;

/// A membership change for a watched name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Update {
    /// The address joined the listing.
    Add(String),
    /// The address left the listing.
    Delete(String),
}

impl Update {
    /// The `host:port` this update is about.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Add(addr) | Self::Delete(addr) => addr,
        }
    }
}

/// Closes a [`Watcher`] from another task.
#[derive(Clone, Debug)]
pub struct Closer(CancellationToken);

impl Closer {
    /// Closes the watcher. An in-flight [`Watcher::next`] returns [`Error::Closed`].
    pub fn close(&self) {
        self.0.cancel();
    }

    /// Returns `true` once the watcher is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Long-poll diff engine for one service name.
pub struct Watcher<R> {
    name: String,
    registry: Arc<R>,
    guard: CallGuard,
    index: Index,
    known: HashSet<String>,
}

impl<R: Registry> Watcher<R> {
    /// Creates a watcher that closes when `parent` is cancelled.
    pub(crate) fn new(
        name: impl Into<String>,
        registry: Arc<R>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            guard: CallGuard::new(parent.child_token(), None),
            index: 0,
            known: HashSet::new(),
        }
    }

    /// Bounds every registry call made by [`next`](Self::next).
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.guard = self.guard.with_deadline(Some(deadline));
        self
    }

    /// The watched name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the last listing this watcher accepted.
    #[must_use]
    pub fn index(&self) -> Index {
        self.index
    }

    /// Addresses delivered so far and not deleted since.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    /// Blocks until membership changes and returns the changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the watcher is closed, without calling the registry.
    /// Registry errors and deadline expiry are returned as is; the watcher keeps its last
    /// accepted index and address set, so calling `next` again resumes from there.
    pub async fn next(&mut self) -> Result<Vec<Update>> {
        loop {
            let (services, index) = self
                .guard
                .run(self.registry.watch_service(&self.name, self.index))
                .await
                .map_err(|e| match e {
                    Error::Cancelled => Error::Closed,
                    other => other,
                })?;

            let current: HashSet<String> = services
                .iter()
                .map(|service| service.address().to_string())
                .collect();

            let updates = diff(&self.known, &current);
            self.index = index;

            if updates.is_empty() {
                tracing::trace!(service = %self.name, index, "membership unchanged");
                continue;
            }

            tracing::debug!(
                service = %self.name,
                index,
                changes = updates.len(),
                "membership changed"
            );

            self.known = current;
            return Ok(updates);
        }
    }

    /// Closes the watcher.
    pub fn close(&self) {
        self.guard.token().cancel();
    }

    /// Returns `true` once the watcher is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.guard.token().is_cancelled()
    }

    /// A handle that closes this watcher from elsewhere.
    #[must_use]
    pub fn closer(&self) -> Closer {
        Closer(self.guard.token().clone())
    }

    /// Resolves once the watcher is closed.
    pub async fn closed(&self) {
        self.guard.token().cancelled().await;
    }

    /// Turns the watcher into a stream of update batches that ends when it is closed.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Update>>> {
        futures::stream::unfold(self, |mut watcher| async move {
            match watcher.next().await {
                Err(Error::Closed) => None,
                result => Some((result, watcher)),
            }
        })
    }
}

/// Deletes for addresses that left, adds for addresses that joined.
fn diff(known: &HashSet<String>, current: &HashSet<String>) -> Vec<Update> {
    let deleted = known
        .difference(current)
        .map(|addr| Update::Delete(addr.clone()));
    let added = current
        .difference(known)
        .map(|addr| Update::Add(addr.clone()));

    deleted.chain(added).collect()
}
