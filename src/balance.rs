//! Feeds watcher updates into a Tonic balance channel.
//!
//! This module drives a [`Watcher`] and sends endpoint changes to a user-provided
//! channel. Users are responsible for creating their own Tonic channel and endpoints.
//!
//! # How It Works
//!
//! 1. Long-polls the registry for the watched service name
//! 2. Resolves each add/delete update to a socket address
//! 3. Sends `Change::Insert` or `Change::Remove` events to the provided sender
//! 4. User's balance channel receives updates and manages connections
//!
//! # Example
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use service_center::{discover, grpc_name, Center, CenterConfig};
//!
//! let center = Center::setup(&CenterConfig::default()).await?;
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! let closer = discover(center.watch(&grpc_name("billing")), tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! });
//!
//! let client = BillingClient::new(channel);
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::backend::Registry;
use crate::error::{Error, Result};
use crate::watcher::{Closer, Update, Watcher};

/// Pause before re-polling after a transient registry failure.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Starts feeding `watcher` updates to the provided sender.
///
/// This function spawns a background task that long-polls the registry and sends
/// `Change` events to the provided sender. The task stops when the returned [`Closer`]
/// is closed, when the owning center shuts down, or when the receiving side of `tx`
/// is dropped. Transient registry failures are retried.
///
/// # Arguments
///
/// * `watcher` - Watcher for the service name, from [`Center::watch`](crate::Center::watch)
/// * `tx` - Sender for endpoint changes (from `Channel::balance_channel()`)
/// * `build` - Function to build an `Endpoint` from a `SocketAddr`
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub fn discover<R, F>(
    watcher: Watcher<R>,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Closer
where
    R: Registry,
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    let closer = watcher.closer();

    tokio::spawn(async move {
        let name = watcher.name().to_string();
        if let Err(e) = discovery_loop(watcher, tx, build).await {
            tracing::error!("endpoint watcher for {name} failed: {e}");
        }
    });

    closer
}

/// Background task that drives the watcher and sends endpoint changes.
async fn discovery_loop<R, F>(
    mut watcher: Watcher<R>,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Result<()>
where
    R: Registry,
    F: Fn(SocketAddr) -> Endpoint,
{
    let mut known: HashSet<SocketAddr> = HashSet::new();

    tracing::debug!("starting endpoint watch for {}", watcher.name());

    loop {
        let next = tokio::select! {
            next = watcher.next() => next,
            () = tx.closed() => {
                tracing::warn!("channel closed, stopping watcher for {}", watcher.name());
                watcher.close();
                return Ok(());
            }
        };

        let updates = match next {
            Ok(updates) => updates,
            Err(Error::Closed) => {
                tracing::debug!("watcher for {} closed", watcher.name());
                return Ok(());
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!("watch of {} failed, retrying: {e}", watcher.name());
                tokio::select! {
                    () = tokio::time::sleep(RETRY_DELAY) => continue,
                    () = watcher.closed() => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        };

        for action in resolve_updates(&updates, &mut known) {
            let change = match action {
                EndpointAction::Insert(addr) => Change::Insert(addr, build(addr)),
                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if tx.send(change).await.is_err() {
                tracing::warn!("channel closed, stopping watcher for {}", watcher.name());
                watcher.close();
                return Ok(());
            }
        }

        tracing::debug!(
            "discovery: {} endpoints for {} at index {}",
            known.len(),
            watcher.name(),
            watcher.index()
        );
    }
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Turns a batch of updates into endpoint actions, tracking what was sent in `known`.
///
/// Addresses whose host is not an IP literal cannot key a balance channel and are
/// skipped.
fn resolve_updates(updates: &[Update], known: &mut HashSet<SocketAddr>) -> Vec<EndpointAction> {
    let mut actions = Vec::new();

    for update in updates {
        let Ok(addr) = update.address().parse::<SocketAddr>() else {
            tracing::debug!("skipping non-IP endpoint: {}", update.address());
            continue;
        };

        match update {
            Update::Add(_) => {
                if known.insert(addr) {
                    tracing::debug!("adding endpoint: {addr}");
                    actions.push(EndpointAction::Insert(addr));
                }
            }
            Update::Delete(_) => {
                if known.remove(&addr) {
                    tracing::debug!("removing endpoint: {addr}");
                    actions.push(EndpointAction::Remove(addr));
                }
            }
        }
    }

    actions
}
